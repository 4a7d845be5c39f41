// src/watcher/state.rs
// Two-phase per-watcher state machine (spec §4.9):
//   StartupBackoff --probe ok--> SteadyReady [emit OnReady once]
//   StartupBackoff --probe fail && attempts<max--> StartupBackoff (backoff)
//   StartupBackoff --probe fail && attempts==max--> SteadyDown (no OnReady)
//   SteadyReady    --probe fail--> SteadyDown   [emit OnDown(err)]
//   SteadyDown     --probe ok--> SteadyReady    [emit OnReady]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    StartupBackoff,
    SteadyReady,
    SteadyDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub ready: bool,
    pub phase: Phase,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub attempt: u32,
}

impl Status {
    pub(super) fn initial() -> Self {
        Self {
            ready: false,
            phase: Phase::StartupBackoff,
            last_error: None,
            last_check: None,
            attempt: 0,
        }
    }
}

/// Outcome of applying one probe result to the current phase. Carries
/// whether an edge callback should fire, decoupled from actually invoking
/// it so the transition logic stays free of side effects.
pub(super) enum Transition {
    StayStartup,
    EnterSteadyDownFromStartup,
    EnterReady { emit_on_ready: bool },
    EnterDown { emit_on_down: bool },
}

pub(super) fn apply_probe_result(
    phase: Phase,
    attempt: u32,
    max_startup_attempts: u32,
    ok: bool,
) -> Transition {
    match (phase, ok) {
        (Phase::StartupBackoff, true) => Transition::EnterReady { emit_on_ready: true },
        (Phase::StartupBackoff, false) => {
            if attempt + 1 >= max_startup_attempts {
                Transition::EnterSteadyDownFromStartup
            } else {
                Transition::StayStartup
            }
        }
        (Phase::SteadyReady, true) => Transition::EnterReady { emit_on_ready: false },
        (Phase::SteadyReady, false) => Transition::EnterDown { emit_on_down: true },
        (Phase::SteadyDown, true) => Transition::EnterReady { emit_on_ready: true },
        (Phase::SteadyDown, false) => Transition::EnterDown { emit_on_down: false },
    }
}
