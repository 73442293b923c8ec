// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use flow::Flow;

use crate::action::OfAction;
use crate::classifier::Match;

/// Identity of a rule within its bridge's rule arena. Everything that needs
/// to point at a rule holds one of these, never a reference; the arena is
/// the single owner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct RuleId(pub u64);

/// What kind of rule this is. The synthetic kinds exist once per bridge and
/// live outside the classifier.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RuleKind {
    Normal,
    /// Chosen when no rule matches: forward to the controller.
    Miss,
    /// Chosen instead of `Miss` when the ingress port suppresses packet-ins.
    NoPacketIn,
    /// Chosen for fragments when fragment handling is `Drop`.
    DropFrags,
}

/// An OpenFlow rule.
#[derive(Clone, Debug)]
pub struct Rule {
    pub id: RuleId,
    pub kind: RuleKind,
    pub table_id: u8,
    pub m: Match,
    pub priority: u16,
    pub cookie: u64,
    /// Seconds without traffic before the rule expires; 0 = never.
    pub idle_timeout: u16,
    /// Seconds of existence before the rule expires; 0 = never.
    pub hard_timeout: u16,
    pub actions: Arc<Vec<OfAction>>,
    pub packet_count: u64,
    pub byte_count: u64,
    pub created: Instant,
    pub used: Option<Instant>,
    /// Flows of the facets currently pointing at this rule, so deletion can
    /// enumerate them without holding pointers into the cache.
    pub facet_flows: HashSet<Flow, ahash::RandomState>,
}

impl Rule {
    /// Credit traffic attributed to this rule.
    pub fn credit(&mut self, packets: u64, bytes: u64, used: Option<Instant>) {
        self.packet_count += packets;
        self.byte_count += bytes;
        if let Some(used) = used {
            self.used = Some(match self.used {
                Some(prev) if prev > used => prev,
                _ => used,
            });
        }
    }

    /// Shorten timeouts, as a FinTimeout action does when it sees FIN/RST.
    /// Zero means "leave alone"; a nonzero value only ever shrinks.
    pub fn reduce_timeouts(&mut self, idle: u16, hard: u16) {
        if idle != 0 && (self.idle_timeout == 0 || self.idle_timeout > idle) {
            self.idle_timeout = idle;
        }
        if hard != 0 && (self.hard_timeout == 0 || self.hard_timeout > hard) {
            self.hard_timeout = hard;
        }
    }

    /// Has the rule passed either of its timeouts at `now`?
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.hard_timeout != 0
            && now.duration_since(self.created).as_secs() >= u64::from(self.hard_timeout)
        {
            return true;
        }
        if self.idle_timeout != 0 {
            let last = self.used.unwrap_or(self.created);
            if now.duration_since(last).as_secs() >= u64::from(self.idle_timeout) {
                return true;
            }
        }
        false
    }
}

/// Whether a flow mod adds or removes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlowModCommand {
    Add,
    /// Remove the rule with exactly this match and priority, if any.
    DeleteStrict,
}

/// A rule-table modification request.
#[derive(Clone, Debug)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub table_id: u8,
    pub m: Match,
    pub priority: u16,
    pub cookie: u64,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub actions: Vec<OfAction>,
}
