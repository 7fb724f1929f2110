//! Background threads of the session.
//!
//! Both loops hold only a weak reference to the session and stop when it is
//! dropped or the shutdown context fires. Sleeping goes through
//! `Shutdown::wait_timeout`, so shutdown interrupts a pending interval.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::info;

use crate::session::Session;
use crate::shutdown::Shutdown;

/// Spawns the alert consumer thread.
///
/// # Errors
///
/// - `io::Error` - The thread could not be spawned
pub(crate) fn spawn_alert_loop(session: Weak<Session>, shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("torrest-alerts".to_string())
        .spawn(move || run_alert_loop(session, shutdown))
}

/// Spawns the prioritizer thread.
///
/// # Errors
///
/// - `io::Error` - The thread could not be spawned
pub(crate) fn spawn_prioritize_loop(
    session: Weak<Session>,
    shutdown: Shutdown,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("torrest-prioritize".to_string())
        .spawn(move || run_prioritize_loop(session, shutdown))
}

fn run_alert_loop(session: Weak<Session>, shutdown: Shutdown) {
    info!("Starting alerts consumer thread");
    let mut last_resume_save = Instant::now();

    loop {
        let interval = {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.consume_alerts();

            let config = session.config();
            if last_resume_save.elapsed() >= config.session.resume_data_interval {
                last_resume_save = Instant::now();
                session.trigger_resume_data();
            }
            session.request_update();
            config.session.alerts_interval
        };

        if shutdown.wait_timeout(interval) {
            break;
        }
    }

    info!("Stopped alerts consumer thread");
}

fn run_prioritize_loop(session: Weak<Session>, shutdown: Shutdown) {
    info!("Starting prioritizer thread");

    loop {
        let interval = {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.prioritize_torrents();
            session.config().session.prioritize_interval
        };

        if shutdown.wait_timeout(interval) {
            break;
        }
    }

    info!("Stopped prioritizer thread");
}
