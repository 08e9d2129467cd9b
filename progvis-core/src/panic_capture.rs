//! Automatic fault capture
//!
//! When `capture_panics` is enabled, a panic anywhere in the process logs
//! the panic message into the session and moves it to `error`. One hook is
//! installed per process and chains to the hook it replaced; reporters
//! register with it instead of stacking hooks of their own.

use std::any::Any;
use std::panic::Location;
use std::sync::{Mutex, MutexGuard, Once, PoisonError, TryLockError, Weak};

use tokio::sync::mpsc;

use crate::session::Session;
use crate::types::Outcome;
use crate::worker::Signal;

/// Session watched by the panic hook
struct Watched {
    session: Weak<Mutex<Session>>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Watched {
    fn is_live(&self) -> bool {
        self.session.strong_count() > 0
    }
}

static WATCHED: Mutex<Vec<Watched>> = Mutex::new(Vec::new());
static HOOK: Once = Once::new();

fn watched() -> MutexGuard<'static, Vec<Watched>> {
    WATCHED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register a session with the process-wide hook, installing it on first use.
///
/// Only a weak reference is kept; entries for dropped reporters are pruned
/// here and whenever the hook fires.
pub(crate) fn install(session: Weak<Mutex<Session>>, signals: mpsc::UnboundedSender<Signal>) {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            capture(info.payload(), info.location());
            previous(info);
        }));
    });

    let mut watched = watched();
    watched.retain(Watched::is_live);
    watched.push(Watched { session, signals });
}

fn capture(payload: &(dyn Any + Send), location: Option<&Location<'_>>) {
    // a panic raised while registering must not deadlock the hook
    let mut watched = match WATCHED.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return,
    };
    watched.retain(Watched::is_live);

    for entry in watched.iter() {
        if let Some(session) = entry.session.upgrade() {
            if record_panic(&session, payload, location) {
                let _ = entry.signals.send(Signal::Force);
            }
        }
    }
}

/// Extract the text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Log the panic and fail the session; returns true if the session changed.
///
/// Uses `try_lock`: a panic raised while the session lock is held must not
/// deadlock the hook.
fn record_panic(
    session: &Mutex<Session>,
    payload: &(dyn Any + Send),
    location: Option<&Location<'_>>,
) -> bool {
    let mut session = match session.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return false,
    };
    if session.is_terminal() {
        return false;
    }

    let origin = location
        .map(|l| format!("{}:{}", l.file(), l.line()))
        .unwrap_or_else(|| "unknown".to_string());
    let message = format!("uncaught panic: {} @ {}", panic_message(payload), origin);
    tracing::error!(session = %session.id(), %message, "Capturing panic");

    let _ = session.record_message(serde_json::Value::String(message));
    session.finish(Outcome::Error).is_ok()
}
