use log::info;
use std::{io::Write, sync::Once};

use tokio::signal::unix::{signal, SignalKind};

/// Init log. Set log format.
pub fn init_log() {
    env_logger::builder()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}:{} - {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();
}

static INIT_LOG: Once = Once::new();

/// Setup.
pub fn setup_log() {
    INIT_LOG.call_once(|| {
        init_log();
    });
}

#[macro_export]
macro_rules! error_bail {
    ($msg:literal $(,)?) => {
        log::error!($msg);
        anyhow::bail!($msg)
    };
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        anyhow::bail!($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        log::error!($fmt, $($arg)*);
        anyhow::bail!($fmt, $($arg)*)
    };
}

async fn wait_for_signal_impl() {
    // Infos here:
    // https://www.gnu.org/software/libc/manual/html_node/Termination-Signals.html
    let (mut signal_terminate, mut signal_interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                log::error!("Failed to install signal handlers.");
                return;
            }
        };

    tokio::select! {
        _ = signal_terminate.recv() => {
            info!("Received SIGTERM.");
        }
        _ = signal_interrupt.recv() => {
            info!("Received SIGINT.");
        }
    };
}

/// Wait for SIGTERM or SIGINT.
pub async fn wait_for_signal() {
    wait_for_signal_impl().await
}

/// Exponential backoff for the `attempt`-th retry, starting from `base_ms`.
///
/// `attempt` starts at 1. The result is capped at 64 times `base_ms`.
pub fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(6);
    base_ms.saturating_mul(1u64 << shift)
}
