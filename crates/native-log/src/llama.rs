//! llama.cpp implementation using `llama_log_set`.

use std::ffi::{c_char, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{HookError, LogSink, NativeLogHook};

/// llama.cpp accepts one log callback for the whole process.
static REGISTERED: AtomicBool = AtomicBool::new(false);

/// Routes llama.cpp / ggml log output into a [`LogSink`].
pub struct LlamaLogHook;

impl NativeLogHook for LlamaLogHook {
    fn register(&self, sink: Arc<LogSink>) -> Result<(), HookError> {
        if REGISTERED.swap(true, Ordering::SeqCst) {
            return Err(HookError::AlreadyRegistered);
        }

        // Leaked on purpose: llama.cpp holds this pointer until the process exits.
        let user_data = Arc::into_raw(sink) as *mut c_void;

        unsafe {
            llama_cpp_sys_2::llama_log_set(Some(log_callback), user_data);
        }

        Ok(())
    }
}

/// The callback handed to llama.cpp.
///
/// # Safety
///
/// `user_data` must be the pointer produced by `Arc::into_raw` in
/// [`LlamaLogHook::register`]; it is never released, so it is valid for
/// every call. `text` is a NUL-terminated string owned by the caller.
unsafe extern "C" fn log_callback(
    level: llama_cpp_sys_2::ggml_log_level,
    text: *const c_char,
    user_data: *mut c_void,
) {
    if text.is_null() || user_data.is_null() {
        return;
    }

    let sink = &*(user_data as *const LogSink);
    let text = CStr::from_ptr(text).to_string_lossy();

    // A panicking subscriber must not unwind into C
    let _ = catch_unwind(AssertUnwindSafe(|| {
        sink.record(level as u32, &text);
    }));
}
