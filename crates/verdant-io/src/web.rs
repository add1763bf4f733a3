//! Browser execution context: a dedicated web worker.
//!
//! The worker runs the `verdant-worker` WASM module. It is created from
//! embedded JS glue and WASM blobs, so no extra static files need to be
//! served. Messages are `{header, pixels}` objects in both directions.

use tracing::debug;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use verdant_worker::Envelope;

use crate::channel::{ChannelError, ContextFactory, ExecutionContext, Inbox};

/// An object URL revoked when dropped.
struct ObjectUrl(String);

impl ObjectUrl {
    fn from_blob(parts: &js_sys::Array, mime_type: &str, what: &str) -> Result<Self, ChannelError> {
        let options = web_sys::BlobPropertyBag::new();
        options.set_type(mime_type);
        let blob = (if mime_type == "application/wasm" {
            web_sys::Blob::new_with_buffer_source_sequence_and_options(parts, &options)
        } else {
            web_sys::Blob::new_with_str_sequence_and_options(parts, &options)
        })
        .map_err(|e| ChannelError::Spawn(format!("failed to create {what} blob: {}", describe(&e))))?;
        web_sys::Url::create_object_url_with_blob(&blob)
            .map(Self)
            .map_err(|e| ChannelError::Spawn(format!("failed to create {what} URL: {}", describe(&e))))
    }
}

impl Drop for ObjectUrl {
    fn drop(&mut self) {
        web_sys::Url::revoke_object_url(&self.0).ok();
    }
}

fn describe(value: &JsValue) -> String {
    value
        .as_string()
        .or_else(|| value.dyn_ref::<js_sys::Error>().map(|e| String::from(e.message())))
        .unwrap_or_else(|| format!("{value:?}"))
}

/// Spawns [`WebWorkerContext`]s from embedded worker assets.
#[derive(Debug, Clone, Copy)]
pub struct WebWorkerFactory {
    /// wasm-bindgen JS glue of the worker module.
    worker_js: &'static str,
    /// The worker's WASM binary.
    worker_wasm: &'static [u8],
}

impl WebWorkerFactory {
    /// A factory over the worker's JS glue and WASM binary, typically
    /// from `include_str!` and `include_bytes!`.
    #[must_use]
    pub const fn new(worker_js: &'static str, worker_wasm: &'static [u8]) -> Self {
        Self {
            worker_js,
            worker_wasm,
        }
    }
}

impl ContextFactory for WebWorkerFactory {
    type Context = WebWorkerContext;

    fn spawn(&self, inbox: Inbox) -> Result<WebWorkerContext, ChannelError> {
        let wasm_parts = js_sys::Array::new();
        wasm_parts.push(&js_sys::Uint8Array::from(self.worker_wasm).buffer());
        let wasm_url = ObjectUrl::from_blob(&wasm_parts, "application/wasm", "WASM")?;

        let wrapper_js = format!(
            r#"{worker_js}

wasm_bindgen("{wasm_url}")
    .catch(function(e) {{ console.error("verdant worker init failed:", e); throw e; }});
"#,
            worker_js = self.worker_js,
            wasm_url = wasm_url.0,
        );
        let js_parts = js_sys::Array::new();
        js_parts.push(&JsValue::from_str(&wrapper_js));
        // Revoked when this function returns; the worker has fetched it by then.
        let js_url = ObjectUrl::from_blob(&js_parts, "application/javascript", "script")?;

        let worker = web_sys::Worker::new(&js_url.0)
            .map_err(|e| ChannelError::Spawn(format!("failed to create Worker: {}", describe(&e))))?;

        let message_inbox = inbox.clone();
        let onmessage = Closure::<dyn FnMut(web_sys::MessageEvent)>::new(
            move |event: web_sys::MessageEvent| match envelope_from_js(&event.data()) {
                Some(envelope) => {
                    message_inbox.deliver(&envelope);
                }
                None => {
                    message_inbox.fail("worker sent a message without a header");
                }
            },
        );
        let onerror =
            Closure::<dyn FnMut(web_sys::ErrorEvent)>::new(move |event: web_sys::ErrorEvent| {
                inbox.fail(format!("worker error: {}", event.message()));
            });
        worker.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
        worker.set_onerror(Some(onerror.as_ref().unchecked_ref()));
        debug!("web worker created");

        Ok(WebWorkerContext {
            worker,
            _onmessage: onmessage,
            _onerror: onerror,
            _wasm_url: wasm_url,
        })
    }
}

/// Unpack `{header, pixels}` from a JS object.
fn envelope_from_js(data: &JsValue) -> Option<Envelope> {
    let header = js_sys::Reflect::get(data, &JsValue::from_str("header"))
        .ok()?
        .as_string()?;
    let pixels = js_sys::Reflect::get(data, &JsValue::from_str("pixels"))
        .ok()
        .and_then(|v| v.dyn_into::<js_sys::Uint8Array>().ok())
        .map(|a| a.to_vec())
        .unwrap_or_default();
    Some(Envelope { header, pixels })
}

/// A running web worker. The handlers and the WASM URL live as long as
/// the worker does.
pub struct WebWorkerContext {
    worker: web_sys::Worker,
    _onmessage: Closure<dyn FnMut(web_sys::MessageEvent)>,
    _onerror: Closure<dyn FnMut(web_sys::ErrorEvent)>,
    _wasm_url: ObjectUrl,
}

impl ExecutionContext for WebWorkerContext {
    fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let message = js_sys::Object::new();
        js_sys::Reflect::set(
            &message,
            &JsValue::from_str("header"),
            &JsValue::from_str(&envelope.header),
        )
        .map_err(|_| ChannelError::Post("failed to set header".into()))?;
        js_sys::Reflect::set(
            &message,
            &JsValue::from_str("pixels"),
            &js_sys::Uint8Array::from(envelope.pixels.as_slice()),
        )
        .map_err(|_| ChannelError::Post("failed to set pixels".into()))?;
        self.worker
            .post_message(&message)
            .map_err(|e| ChannelError::Post(format!("postMessage failed: {}", describe(&e))))
    }

    fn terminate(&self) {
        self.worker.set_onmessage(None);
        self.worker.set_onerror(None);
        self.worker.terminate();
    }
}

impl Drop for WebWorkerContext {
    fn drop(&mut self) {
        self.terminate();
    }
}
