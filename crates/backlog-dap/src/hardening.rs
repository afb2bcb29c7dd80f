use std::sync::{Arc, OnceLock};

use backlog_config::{init_tracing, AdapterConfig};
use parking_lot::Mutex;

pub type PanicNotifier = Arc<dyn Fn(&str) + Send + Sync + 'static>;

static NOTIFIERS: OnceLock<Mutex<Vec<PanicNotifier>>> = OnceLock::new();

/// Initialize structured logging and install a global panic hook for the
/// adapter process.
///
/// The hook logs the panic through `tracing` before chaining to the previous
/// hook, then tells every registered notifier. Safe to call more than once;
/// later calls only add notifiers.
pub fn init(config: &AdapterConfig, notifier: PanicNotifier) {
    init_tracing(&config.logging);
    install_panic_hook(notifier);
}

fn install_panic_hook(notifier: PanicNotifier) {
    let mut installed = false;
    let notifiers = NOTIFIERS.get_or_init(|| {
        installed = true;
        Mutex::new(Vec::new())
    });
    notifiers.lock().push(notifier);
    if !installed {
        return;
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = panic_message(info);
        let location = info.location().map(|loc| loc.to_string());
        tracing::error!(
            target: "backlog.panic",
            panic_message = %message,
            panic_location = %location.as_deref().unwrap_or("<unknown>"),
            "panic captured"
        );
        previous(info);

        let notification = format!("backlog-dap hit an internal error: {message}");
        let notifiers = NOTIFIERS
            .get()
            .map(|notifiers| notifiers.lock().clone())
            .unwrap_or_default();
        for notify in notifiers {
            notify(&notification);
        }
    }));
}

fn panic_message(info: &std::panic::PanicHookInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "panic payload (non-string)".to_owned()
    }
}
