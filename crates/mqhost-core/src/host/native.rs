//! Host surface backed by a native function table.
//!
//! The native loader shim passes a [`NativeHostApi`] to `mqhost_initialize`.
//! All pointer and C string handling for host calls lives in this module.

use std::ffi::{CStr, CString, c_char};

use crate::error::{Error, Result};

use super::{HostSurface, MAX_LINE_CHARS};

/// Version of [`NativeHostApi`] this crate understands.
pub const NATIVE_API_VERSION: u32 = 1;

pub type WriteChatFn = unsafe extern "C" fn(text: *const c_char);
pub type DoCommandFn = unsafe extern "C" fn(command: *const c_char);
pub type ParseMacroDataFn = unsafe extern "C" fn(buffer: *mut c_char, capacity: u32) -> bool;
pub type CalculateFn = unsafe extern "C" fn(formula: *const c_char, result: *mut f64) -> bool;
pub type AddCommandFn = unsafe extern "C" fn(name: *const c_char) -> bool;
pub type RemoveCommandFn = unsafe extern "C" fn(name: *const c_char) -> bool;

/// Function table supplied by the native shim.
///
/// Commands registered through `add_command` are dispatched back through
/// `mqhost_on_command`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeHostApi {
    pub version: u32,
    pub write_chat: Option<WriteChatFn>,
    pub do_command: Option<DoCommandFn>,
    pub parse_macro_data: Option<ParseMacroDataFn>,
    pub calculate: Option<CalculateFn>,
    pub add_command: Option<AddCommandFn>,
    pub remove_command: Option<RemoveCommandFn>,
}

/// [`HostSurface`] over a validated [`NativeHostApi`].
#[derive(Debug, Clone, Copy)]
pub struct NativeHost {
    write_chat: WriteChatFn,
    do_command: DoCommandFn,
    parse_macro_data: ParseMacroDataFn,
    calculate: CalculateFn,
    add_command: AddCommandFn,
    remove_command: RemoveCommandFn,
}

impl NativeHost {
    /// Validate the table: matching version and every entry present.
    pub fn new(api: &NativeHostApi) -> Result<Self> {
        if api.version != NATIVE_API_VERSION {
            return Err(Error::Host(format!(
                "native API version {} is not supported (expected {})",
                api.version, NATIVE_API_VERSION
            )));
        }

        fn required<T>(entry: Option<T>, name: &str) -> Result<T> {
            entry.ok_or_else(|| Error::Host(format!("native API is missing {}", name)))
        }

        Ok(Self {
            write_chat: required(api.write_chat, "write_chat")?,
            do_command: required(api.do_command, "do_command")?,
            parse_macro_data: required(api.parse_macro_data, "parse_macro_data")?,
            calculate: required(api.calculate, "calculate")?,
            add_command: required(api.add_command, "add_command")?,
            remove_command: required(api.remove_command, "remove_command")?,
        })
    }
}

/// Convert to a C string, cutting at the first interior NUL.
fn to_c_string(text: &str) -> CString {
    let head = text.split('\0').next().unwrap_or_default();
    CString::new(head).unwrap_or_default()
}

/// Copy a NUL-terminated string received from the host.
///
/// Returns an empty string for a null pointer. Invalid UTF-8 is replaced.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
pub unsafe fn string_from_ptr(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract.
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

impl HostSurface for NativeHost {
    fn send_command(&self, command: &str) {
        let command = to_c_string(command);
        // SAFETY: the table was validated and the string outlives the call.
        unsafe { (self.do_command)(command.as_ptr()) }
    }

    fn write_line(&self, text: &str) {
        let text = to_c_string(text);
        // SAFETY: as above.
        unsafe { (self.write_chat)(text.as_ptr()) }
    }

    fn parse_variables(&self, text: &str) -> Result<String> {
        // The host parses in place into a fixed-size buffer.
        let mut buffer = vec![0u8; MAX_LINE_CHARS + 1];
        let bytes = to_c_string(text).into_bytes();
        let len = bytes.len().min(MAX_LINE_CHARS);
        buffer[..len].copy_from_slice(&bytes[..len]);

        // SAFETY: the buffer is NUL-terminated and `capacity` matches its length.
        let ok = unsafe {
            (self.parse_macro_data)(buffer.as_mut_ptr().cast::<c_char>(), buffer.len() as u32)
        };
        if !ok {
            return Err(Error::Host(format!("could not parse expression: {}", text)));
        }

        let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
        Ok(String::from_utf8_lossy(&buffer[..end]).into_owned())
    }

    fn evaluate_expression(&self, formula: &str) -> Result<f64> {
        let c_formula = to_c_string(formula);
        let mut result = 0.0f64;
        // SAFETY: valid string and a valid out pointer for the call's duration.
        let ok = unsafe { (self.calculate)(c_formula.as_ptr(), &mut result) };
        if ok {
            Ok(result)
        } else {
            Err(Error::Host(format!("could not evaluate: {}", formula)))
        }
    }

    fn add_command(&self, name: &str) -> Result<()> {
        let c_name = to_c_string(name);
        // SAFETY: as above.
        if unsafe { (self.add_command)(c_name.as_ptr()) } {
            Ok(())
        } else {
            Err(Error::Host(format!("host refused to add command {}", name)))
        }
    }

    fn remove_command(&self, name: &str) -> Result<()> {
        let c_name = to_c_string(name);
        // SAFETY: as above.
        if unsafe { (self.remove_command)(c_name.as_ptr()) } {
            Ok(())
        } else {
            Err(Error::Host(format!("host refused to remove command {}", name)))
        }
    }
}
