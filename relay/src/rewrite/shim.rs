//! Client-side shim injected into rewritten pages.
//!
//! Catches what static rewriting cannot: iframe and media sources assigned
//! from script, and media fetched through `window.fetch`.

use super::{RewriteContext, IFRAME_RELAY_PATH, MEDIA_RELAY_PATH};

/// Attribute carried by the shim's script element. Its presence means the
/// page has already been rewritten.
pub const SHIM_MARKER: &str = "data-mirrorgate-shim";

const SHIM_BODY: &str = r#"(function () {
  if (window.__mirrorgate) { return; }
  window.__mirrorgate = true;
  var ORIGIN = __ORIGIN__, IFRAME = __IFRAME__, MEDIA = __MEDIA__;
  var STREAM = /\.(m3u8|mp4|ts|m4s|webm|mpd)$/i;
  function absolute(value) {
    try { return new URL(value, document.baseURI); } catch (e) { return null; }
  }
  function relayed(value, endpoint) {
    var url = absolute(String(value));
    if (!url || (url.protocol !== "http:" && url.protocol !== "https:")) { return value; }
    if (url.href.indexOf(ORIGIN) === 0) { return value; }
    return endpoint + "?url=" + encodeURIComponent(url.href);
  }
  function hook(proto, endpoint) {
    var desc = proto && Object.getOwnPropertyDescriptor(proto, "src");
    if (!desc || !desc.set) { return; }
    Object.defineProperty(proto, "src", {
      configurable: true,
      enumerable: desc.enumerable,
      get: desc.get,
      set: function (value) { desc.set.call(this, relayed(value, endpoint)); }
    });
  }
  hook(window.HTMLIFrameElement && HTMLIFrameElement.prototype, IFRAME);
  hook(window.HTMLMediaElement && HTMLMediaElement.prototype, MEDIA);
  if (window.fetch) {
    var nativeFetch = window.fetch;
    window.fetch = function (input, init) {
      var raw = typeof input === "string" ? input : (input && input.url);
      var url = raw ? absolute(raw) : null;
      if (url && STREAM.test(url.pathname)) {
        var next = relayed(url.href, MEDIA);
        if (next !== url.href) { return nativeFetch.call(this, next, init); }
      }
      return nativeFetch.apply(this, arguments);
    };
  }
})();"#;

/// The `<script>` element to inject, bound to this proxy's endpoints
pub fn client_shim(ctx: &RewriteContext) -> String {
    let origin = ctx.proxy_origin();
    let body = SHIM_BODY
        .replace("__ORIGIN__", &js_string(origin))
        .replace("__IFRAME__", &js_string(&format!("{}{}", origin, IFRAME_RELAY_PATH)))
        .replace("__MEDIA__", &js_string(&format!("{}{}", origin, MEDIA_RELAY_PATH)));
    format!("<script {}>{}</script>", SHIM_MARKER, body)
}

/// JSON string literal safe to embed in a script element
fn js_string(value: &str) -> String {
    serde_json::Value::from(value).to_string().replace('<', "\\u003c")
}
