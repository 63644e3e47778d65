//! Per-entry idle state and its transition function.

use pipe_mgr_types::{EntHdl, PipeBitmap};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Notify-mode state of one physical entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifyState {
    #[default]
    Invalid,
    /// TTL of zero; never ages.
    Disabled,
    Active,
    /// Hardware reported idle but TTL remains; waiting for the next sweep.
    SweepCandidate,
    /// Decaying in software on every sweep tick.
    Sweep,
    Idle,
}

impl fmt::Display for NotifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotifyState::Invalid => "invalid",
            NotifyState::Disabled => "disabled",
            NotifyState::Active => "active",
            NotifyState::SweepCandidate => "sweep-candidate",
            NotifyState::Sweep => "sweep",
            NotifyState::Idle => "idle",
        };
        write!(f, "{}", s)
    }
}

/// Poll-mode state. `Active` orders above `Idle` so aggregation across pipes
/// is a maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PollState {
    Idle,
    #[default]
    Active,
}

/// Hit state reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HitState {
    Idle,
    Active,
}

/// Inputs of the notify-mode state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Add { ttl: u32, cur_ttl: u32 },
    UpdateTtl { ttl: u32, cur_ttl: u32 },
    ResetTtl,
    /// Every pipe of the entry's scope reported it idle.
    HwIdle { notify_period: u32 },
    HwActive,
    /// Batched once per sweep tick.
    Promote,
    SweepTick { period: u32 },
}

impl NotifyEvent {
    /// Every event kind, with representative parameters.
    pub fn samples() -> Vec<NotifyEvent> {
        vec![
            NotifyEvent::Add { ttl: 0, cur_ttl: 0 },
            NotifyEvent::Add { ttl: 500, cur_ttl: 500 },
            NotifyEvent::Add { ttl: 500, cur_ttl: 300 },
            NotifyEvent::UpdateTtl { ttl: 0, cur_ttl: 0 },
            NotifyEvent::UpdateTtl { ttl: 800, cur_ttl: 800 },
            NotifyEvent::ResetTtl,
            NotifyEvent::HwIdle { notify_period: 200 },
            NotifyEvent::HwIdle { notify_period: 2000 },
            NotifyEvent::HwActive,
            NotifyEvent::Promote,
            NotifyEvent::SweepTick { period: 100 },
            NotifyEvent::SweepTick { period: 1000 },
        ]
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: NotifyState,
    pub init_ttl: u32,
    pub cur_ttl: u32,
    /// Callback the application must receive.
    pub notify: Option<HitState>,
}

/// The notify-mode transition function. Total over every state and event;
/// `Disabled` never leaves.
pub fn transition(state: NotifyState, init_ttl: u32, cur_ttl: u32, event: NotifyEvent) -> Transition {
    let stay = Transition {
        next: state,
        init_ttl,
        cur_ttl,
        notify: None,
    };
    let to = |next, init_ttl, cur_ttl, notify| Transition {
        next,
        init_ttl,
        cur_ttl,
        notify,
    };
    use NotifyState::*;

    match (state, event) {
        (Disabled, _) => stay,

        (Invalid, NotifyEvent::Add { ttl: 0, .. }) => to(Disabled, 0, 0, None),
        (Invalid, NotifyEvent::Add { ttl, cur_ttl }) if cur_ttl >= ttl => to(Active, ttl, ttl, None),
        (Invalid, NotifyEvent::Add { ttl, cur_ttl }) => to(SweepCandidate, ttl, cur_ttl, None),
        (Invalid, _) => stay,
        (_, NotifyEvent::Add { .. }) => stay,

        (_, NotifyEvent::UpdateTtl { ttl: 0, .. }) => to(Idle, 0, 0, None),
        (_, NotifyEvent::UpdateTtl { ttl, cur_ttl }) => to(state, ttl, cur_ttl.min(ttl), None),

        (_, NotifyEvent::ResetTtl) => to(Active, init_ttl, init_ttl, None),

        (Active, NotifyEvent::HwIdle { notify_period }) if cur_ttl <= notify_period => {
            to(Idle, init_ttl, 0, Some(HitState::Idle))
        }
        (Active, NotifyEvent::HwIdle { notify_period }) => {
            to(SweepCandidate, init_ttl, cur_ttl - notify_period, None)
        }
        (_, NotifyEvent::HwIdle { .. }) => stay,

        (Idle, NotifyEvent::HwActive) => to(Active, init_ttl, init_ttl, Some(HitState::Active)),
        // Never reported idle, so the application hears nothing.
        (SweepCandidate | Sweep, NotifyEvent::HwActive) => to(Active, init_ttl, init_ttl, None),
        (_, NotifyEvent::HwActive) => stay,

        (SweepCandidate, NotifyEvent::Promote) => to(Sweep, init_ttl, cur_ttl, None),
        (_, NotifyEvent::Promote) => stay,

        (Sweep, NotifyEvent::SweepTick { period }) if cur_ttl <= period => {
            to(Idle, init_ttl, 0, Some(HitState::Idle))
        }
        (Sweep, NotifyEvent::SweepTick { period }) => to(Sweep, init_ttl, cur_ttl - period, None),
        (_, NotifyEvent::SweepTick { .. }) => stay,
    }
}

/// One physical slot of an idle-enabled stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleEntry {
    pub ent_hdl: EntHdl,
    pub inuse: bool,
    pub init_ttl: u32,
    pub cur_ttl: u32,
    pub notify_state: NotifyState,
    pub poll_state: PollState,
    /// Consecutive inactive dumps since the last active one.
    pub update_count: u32,
    /// Pipes that reported the entry idle since it was last active.
    pub pipes_idle: PipeBitmap,
}

impl IdleEntry {
    /// Applies a notify-mode event and returns the callback to deliver.
    pub fn apply(&mut self, event: NotifyEvent) -> Option<HitState> {
        let t = transition(self.notify_state, self.init_ttl, self.cur_ttl, event);
        self.notify_state = t.next;
        self.init_ttl = t.init_ttl;
        self.cur_ttl = t.cur_ttl;
        t.notify
    }

    /// Applies one poll-mode dump observation. An entry turns idle only
    /// after `pipe_count` inactive dumps in a row.
    pub fn apply_dump(&mut self, active: bool, pipe_count: u32) -> PollState {
        if active {
            self.update_count = 0;
            self.poll_state = PollState::Active;
        } else {
            self.update_count = self.update_count.saturating_add(1);
            if self.update_count >= pipe_count {
                self.poll_state = PollState::Idle;
            }
        }
        self.poll_state
    }

    pub fn clear(&mut self) {
        *self = IdleEntry::default();
    }
}
