//! Write and print listener interfaces.
//!
//! A write listener is a sink for entity mutation events; the runtime
//! iterates listeners synchronously on every mutation. A print listener
//! receives `print` opcode output.

use crate::string_pool::StringId;

/// Events a write listener observes. Values are passed pre-serialized so
/// listeners never hold node handles across GC points.
pub trait WriteListener: Send + Sync {
    /// A whole entity root was replaced; `new_root` is its serialization.
    fn log_write_to_entity(&self, entity_path: &str, new_root: &str);
    /// A single label value was written. `direct` reports whether the
    /// subtree was replaced rather than copied over.
    fn log_write_value_to_entity(&self, entity_path: &str, label: StringId, value: &str, direct: bool);
    fn log_create_entity(&self, entity_path: &str);
    fn log_destroy_entity(&self, entity_path: &str);
    fn log_set_random_seed(&self, entity_path: &str, seed: &str);
    fn log_system_call(&self, command: &str);
}

/// Sink for `print` output.
pub trait PrintListener: Send + Sync {
    fn log_print(&self, text: &str);
    fn flush_log_file(&self);
}

/// Print listener writing to stdout.
#[derive(Default)]
pub struct StdoutPrintListener;

impl PrintListener for StdoutPrintListener {
    fn log_print(&self, text: &str) {
        use std::io::Write;
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = lock.write_all(text.as_bytes());
    }

    fn flush_log_file(&self) {
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }
}

/// Write listener that traces mutations through the `log` facade; useful
/// for debugging entity persistence.
#[derive(Default)]
pub struct TraceWriteListener;

impl WriteListener for TraceWriteListener {
    fn log_write_to_entity(&self, entity_path: &str, _new_root: &str) {
        log::debug!("entity {entity_path}: root replaced");
    }

    fn log_write_value_to_entity(&self, entity_path: &str, label: StringId, value: &str, direct: bool) {
        log::debug!(
            "entity {entity_path}: label {} <- {value} (direct: {direct})",
            crate::string_pool::string_pool().string(label)
        );
    }

    fn log_create_entity(&self, entity_path: &str) {
        log::debug!("entity {entity_path}: created");
    }

    fn log_destroy_entity(&self, entity_path: &str) {
        log::debug!("entity {entity_path}: destroyed");
    }

    fn log_set_random_seed(&self, entity_path: &str, seed: &str) {
        log::debug!("entity {entity_path}: random seed set to {seed}");
    }

    fn log_system_call(&self, command: &str) {
        log::debug!("system call: {command}");
    }
}
