//! Reporting the before and after state of toggle-style commands.

use std::{fmt, future::Future, time::Duration};

use crate::{error::Result, output::print_message};

/// Some settings report stale values right after being changed (e.g. mobile data).
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// A setting's state as shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    On,
    PartiallyOn,
    Off,
    Unknown,
}

impl State {
    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("on"),
            Self::PartiallyOn => f.write_str("partially on"),
            Self::Off => f.write_str("off"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Reads the state, runs the action, waits `settle`, reads the state again and prints what
/// changed.
pub async fn report_state_change<T, R, RF, A, AF>(
    title: &str,
    settle: Duration,
    read_state: R,
    action: A,
) -> Result<T>
where
    R: Fn() -> RF,
    RF: Future<Output = Result<State>>,
    A: FnOnce() -> AF,
    AF: Future<Output = Result<T>>,
{
    let old_state = read_state().await?;
    let value = action().await?;
    tokio::time::sleep(settle).await;
    let new_state = read_state().await?;
    print_message(&describe_state_change(title, &old_state, &new_state));
    Ok(value)
}

pub fn describe_state_change(title: &str, old_state: &State, new_state: &State) -> String {
    if old_state != new_state {
        format!("\"{title}\" state changed from \"{old_state}\" -> \"{new_state}\"")
    } else {
        format!("\"{title}\" state unchanged ({old_state})")
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    #[test]
    fn describe_changed_and_unchanged() {
        assert_eq!(
            "\"Wi-Fi\" state changed from \"off\" -> \"on\"",
            describe_state_change("Wi-Fi", &State::Off, &State::On)
        );
        assert_eq!(
            "\"Wi-Fi\" state unchanged (partially on)",
            describe_state_change("Wi-Fi", &State::PartiallyOn, &State::PartiallyOn)
        );
    }

    #[tokio::test]
    async fn reads_state_around_action() {
        let events = &Mutex::new(Vec::new());
        let reads = &AtomicUsize::new(0);
        let value = report_state_change(
            "Test",
            Duration::ZERO,
            || async move {
                let n = reads.fetch_add(1, Ordering::SeqCst);
                events.lock().unwrap().push(format!("read {n}"));
                Ok(State::from_bool(n > 0))
            },
            || async move {
                events.lock().unwrap().push("act".to_owned());
                Ok(42)
            },
        )
        .await
        .unwrap();
        assert_eq!(42, value);
        assert_eq!(
            vec!["read 0", "act", "read 1"],
            *events.lock().unwrap()
        );
    }
}
