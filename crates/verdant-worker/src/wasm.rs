//! Web worker entry point.
//!
//! Compiled into the standalone WASM module the browser runs inside a
//! `Worker`. The main thread posts a JS object with:
//! - `header`: `String` containing a JSON-serialized [`Request`](crate::Request)
//! - `pixels`: `Uint8Array` with the raw RGBA payload (may be empty)
//!
//! and receives an object of the same shape whose header is a
//! [`Response`](crate::Response).

use std::cell::RefCell;

use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

use crate::handler::WorkerState;
use crate::protocol::{Envelope, Response};

thread_local! {
    static STATE: RefCell<WorkerState> = const { RefCell::new(WorkerState::new()) };
}

/// Called automatically when the WASM module is instantiated in the
/// worker context.
#[wasm_bindgen(start)]
pub fn worker_main() {
    console_error_panic_hook::set_once();

    let Ok(global) = js_sys::global().dyn_into::<web_sys::DedicatedWorkerGlobalScope>() else {
        web_sys::console::error_1(&"verdant-worker: not running in a DedicatedWorkerGlobalScope".into());
        return;
    };

    let onmessage =
        Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |event: web_sys::MessageEvent| {
            handle_message(&event);
        });
    global.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
    onmessage.forget(); // leak: lives for the worker lifetime
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

fn handle_message(event: &web_sys::MessageEvent) {
    let reply = match envelope_from_js(&event.data()) {
        Some(envelope) => STATE.with(|state| state.borrow_mut().handle(envelope)),
        None => Envelope::response(&Response::Fatal {
            reason: "message is missing its header".into(),
        })
        .unwrap_or_default(),
    };
    post(&reply);
}

fn post(envelope: &Envelope) {
    let response = js_sys::Object::new();
    let _ = js_sys::Reflect::set(
        &response,
        &JsValue::from_str("header"),
        &JsValue::from_str(&envelope.header),
    );
    let _ = js_sys::Reflect::set(
        &response,
        &JsValue::from_str("pixels"),
        &js_sys::Uint8Array::from(envelope.pixels.as_slice()),
    );

    if let Ok(global) = js_sys::global().dyn_into::<web_sys::DedicatedWorkerGlobalScope>() {
        let _ = global.post_message(&response);
    }
}
