//! Native entry points for the MQHost runtime.
//!
//! The host's loader shim calls [`mqhost_initialize`] once with the host
//! directory and a [`NativeHostApi`] table, then forwards every callback
//! through the `mqhost_on_*` functions until [`mqhost_shutdown`].
//!
//! ```text
//! native shim ──► mqhost_initialize ──► PluginHost::builder(..).build()
//!             ──► mqhost_on_pulse   ──► PluginHost::on_pulse
//!             ──► mqhost_on_command ──► PluginHost::on_command
//!             ──► mqhost_shutdown   ──► PluginHost::shutdown + drop
//! ```
//!
//! No callback unwinds into the host: panics are caught at this boundary.

use std::ffi::c_char;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;

use mqhost_core::cleanup::panic_message;
use mqhost_core::events::HostEvent;
use mqhost_core::host::native::{NativeHost, NativeHostApi, string_from_ptr};
use mqhost_core::{HostHandle, HostSurface, MessageSource, PluginHost};

pub use mqhost_core::host::native::NATIVE_API_VERSION;

static PLUGIN: RwLock<Option<Arc<PluginHost>>> = RwLock::new(None);

/// Run `f` against the live plugin, if any, without letting a panic escape.
fn with_plugin<R>(callback: &str, fallback: R, f: impl FnOnce(&PluginHost) -> R) -> R {
    // Clone out so callbacks may re-enter the lock (e.g. a command calling shutdown).
    let Some(plugin) = PLUGIN.read().clone() else {
        return fallback;
    };

    match catch_unwind(AssertUnwindSafe(|| f(&plugin))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("{} panicked: {}", callback, message);
            plugin
                .host()
                .error(MessageSource::Plugin, &format!("{} failed: {}", callback, message));
            fallback
        }
    }
}

fn initialize(host_dir: String, api: &NativeHostApi) -> bool {
    let surface: Arc<dyn HostSurface> = match NativeHost::new(api) {
        Ok(native) => Arc::new(native),
        Err(e) => {
            tracing::error!("Rejected native host table: {}", e);
            return false;
        }
    };
    let host = HostHandle::new(Arc::clone(&surface));

    let mut slot = PLUGIN.write();
    if slot.is_some() {
        tracing::warn!("MQHost is already initialized");
        host.warning(MessageSource::Plugin, "MQHost is already initialized.");
        return false;
    }

    match PluginHost::builder(&host_dir, surface).build() {
        Ok(plugin) => {
            tracing::info!("MQHost plugin initialized from {}", host_dir);
            host.info(MessageSource::Plugin, "Initialized.");
            *slot = Some(Arc::new(plugin));
            true
        }
        Err(e) => {
            tracing::error!("Failed to initialize MQHost: {}", e);
            host.error(
                MessageSource::Plugin,
                &format!("Failed to initialize: {}", e),
            );
            false
        }
    }
}

/// Create the runtime. Returns `false` if the table is invalid, the runtime
/// is already initialized, or startup failed.
///
/// # Safety
/// `host_dir` must be null or a valid NUL-terminated string; `api` must be
/// null or point to a valid [`NativeHostApi`]. Both are only read during the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mqhost_initialize(
    host_dir: *const c_char,
    api: *const NativeHostApi,
) -> bool {
    if api.is_null() {
        return false;
    }
    // SAFETY: per the contract above.
    let host_dir = unsafe { string_from_ptr(host_dir) };
    // SAFETY: non-null and valid per the contract above.
    let api = unsafe { *api };

    catch_unwind(AssertUnwindSafe(|| initialize(host_dir, &api))).unwrap_or_else(|payload| {
        tracing::error!("Initialization panicked: {}", panic_message(payload.as_ref()));
        false
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_on_pulse() {
    with_plugin("OnPulse", (), PluginHost::on_pulse);
}

/// Dispatch a registered command. Returns whether MQHost handled it.
///
/// # Safety
/// Both pointers must be null or valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mqhost_on_command(name: *const c_char, arguments: *const c_char) -> bool {
    // SAFETY: per the contract above.
    let (name, arguments) = unsafe { (string_from_ptr(name), string_from_ptr(arguments)) };
    with_plugin("OnCommand", false, |plugin| plugin.on_command(&name, &arguments))
}

/// # Safety
/// `line` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mqhost_on_incoming_chat(line: *const c_char, color: u32) {
    // SAFETY: per the contract above.
    let line = unsafe { string_from_ptr(line) };
    with_plugin("OnIncomingChat", (), |plugin| plugin.on_incoming_chat(&line, color));
}

/// # Safety
/// `line` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mqhost_on_write_chat(line: *const c_char, color: u32, filter: u32) {
    // SAFETY: per the contract above.
    let line = unsafe { string_from_ptr(line) };
    with_plugin("OnWriteChat", (), |plugin| plugin.on_write_chat(&line, color, filter));
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_set_game_state(state: u32) {
    with_plugin("SetGameState", (), |plugin| plugin.set_game_state(state));
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_begin_zone() {
    with_plugin("BeginZone", (), |plugin| plugin.on_event(HostEvent::BeginZone));
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_end_zone() {
    with_plugin("EndZone", (), |plugin| plugin.on_event(HostEvent::EndZone));
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_on_zoned() {
    with_plugin("OnZoned", (), |plugin| plugin.on_event(HostEvent::Zoned));
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_on_reload_ui() {
    with_plugin("OnReloadUI", (), |plugin| plugin.on_event(HostEvent::ReloadUi));
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_on_clean_ui() {
    with_plugin("OnCleanUI", (), |plugin| plugin.on_event(HostEvent::CleanUi));
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_on_add_spawn(id: u64) {
    with_plugin("OnAddSpawn", (), |plugin| plugin.on_event(HostEvent::AddSpawn { id }));
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_on_remove_spawn(id: u64) {
    with_plugin("OnRemoveSpawn", (), |plugin| {
        plugin.on_event(HostEvent::RemoveSpawn { id })
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_on_add_ground_item(id: u64) {
    with_plugin("OnAddGroundItem", (), |plugin| {
        plugin.on_event(HostEvent::AddGroundItem { id })
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn mqhost_on_remove_ground_item(id: u64) {
    with_plugin("OnRemoveGroundItem", (), |plugin| {
        plugin.on_event(HostEvent::RemoveGroundItem { id })
    });
}

/// Stop every program, remove every command and release the runtime.
/// A later [`mqhost_initialize`] starts from scratch.
#[unsafe(no_mangle)]
pub extern "C" fn mqhost_shutdown() {
    let Some(plugin) = PLUGIN.write().take() else {
        return;
    };

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| plugin.shutdown())) {
        tracing::error!("Shutdown panicked: {}", panic_message(payload.as_ref()));
    }
    drop(plugin);
}
