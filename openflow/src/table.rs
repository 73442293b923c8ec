// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-bridge rule tables and the rule arena.
//!
//! Every rule of a bridge lives in one id-keyed arena; the per-table
//! classifiers hold ids only. Each table additionally tracks whether its set
//! of mask shapes is narrow enough — at most a catch-all plus one other —
//! for flow mods to be translated into revalidation *tags* instead of
//! whole-backer revalidation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use flow::{Flow, Minimask, Wildcards, hash_words, map_hasher};

use crate::classifier::{Classifier, Match};
use crate::rule::{FlowMod, FlowModCommand, Rule, RuleId, RuleKind};
use crate::tag::{Tag, TagSet};

/// Number of OpenFlow tables per bridge.
pub const N_TABLES: usize = 255;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("no table {0}")]
    NoSuchTable(u8),
    #[error("no rule {0:?}")]
    NoSuchRule(RuleId),
}

/// How much revalidation a table change requires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RevalScope {
    /// Only facets whose tag set intersects these tags.
    Tags(TagSet),
    /// Every facet.
    All,
}

impl RevalScope {
    pub fn union(&mut self, other: RevalScope) {
        match (*self, other) {
            (RevalScope::Tags(mut a), RevalScope::Tags(b)) => {
                a.union(b);
                *self = RevalScope::Tags(a);
            }
            _ => *self = RevalScope::All,
        }
    }
}

/// Result of applying one flow mod.
#[derive(Debug)]
pub struct FlowModOutcome {
    pub added: Option<RuleId>,
    /// Rules displaced or deleted, moved out of the arena.
    pub removed: Vec<Rule>,
    pub revalidate: RevalScope,
}

struct Table {
    cls: Classifier,
    basis: u32,
    /// Shape-narrow enough for tagging?
    taggable: bool,
    /// The single non-catchall mask shape, when taggable.
    other: Option<Minimask>,
}

impl Table {
    fn new(index: u8) -> Table {
        Table {
            cls: Classifier::new(),
            basis: hash_words(&[u32::from(index)], 0x7453_a2e1),
            taggable: true,
            other: None,
        }
    }

    /// Recompute taggability from the classifier's current mask shapes.
    /// Returns true if it changed.
    fn update_taggable(&mut self) -> bool {
        let mut others: Vec<&Minimask> = Vec::new();
        for mask in self.cls.subtable_masks() {
            if !mask.is_catchall() && !others.contains(&mask) {
                others.push(mask);
            }
        }
        let (taggable, other) = match others.len() {
            0 => (true, None),
            1 => (true, Some(others[0].clone())),
            _ => (false, None),
        };
        let changed = taggable != self.taggable || other != self.other;
        self.taggable = taggable;
        self.other = other;
        changed
    }

    fn tag_for(&self, flow: &Flow, rule_wc: &Wildcards) -> Option<Tag> {
        if !self.taggable || rule_wc.is_catchall() {
            return None;
        }
        let other = self.other.as_ref()?;
        Some(Tag::deterministic(other.hash_flow(flow, self.basis)))
    }
}

/// All rules of one bridge.
pub struct RuleTable {
    tables: Vec<Table>,
    rules: HashMap<RuleId, Rule, ahash::RandomState>,
    next_id: u64,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTable {
    #[must_use]
    pub fn new() -> RuleTable {
        RuleTable {
            tables: (0..N_TABLES).map(|i| Table::new(i as u8)).collect(),
            rules: HashMap::with_hasher(map_hasher()),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> RuleId {
        let id = RuleId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create a synthetic rule (miss / no-packet-in / drop-frags). It lives
    /// in the arena but never in a classifier.
    pub fn add_internal(
        &mut self,
        kind: RuleKind,
        actions: Vec<crate::action::OfAction>,
        now: Instant,
    ) -> RuleId {
        let id = self.alloc_id();
        self.rules.insert(
            id,
            Rule {
                id,
                kind,
                table_id: 0,
                m: Match::catchall(),
                priority: 0,
                cookie: 0,
                idle_timeout: 0,
                hard_timeout: 0,
                actions: Arc::new(actions),
                packet_count: 0,
                byte_count: 0,
                created: now,
                used: None,
                facet_flows: std::collections::HashSet::with_hasher(map_hasher()),
            },
        );
        id
    }

    #[must_use]
    pub fn rule(&self, id: RuleId) -> Option<&Rule> {
        self.rules.get(&id)
    }

    pub fn rule_mut(&mut self, id: RuleId) -> Option<&mut Rule> {
        self.rules.get_mut(&id)
    }

    /// Every rule in the arena, synthetic ones included.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    #[must_use]
    pub fn n_rules(&self) -> usize {
        self.rules
            .values()
            .filter(|r| r.kind == RuleKind::Normal)
            .count()
    }

    /// Classifier lookup in one table. Folds probed masks into `wc`; the
    /// mandatory bits of §rule-table-adapter are the caller's business.
    #[must_use]
    pub fn lookup(&self, table_id: u8, flow: &Flow, wc: Option<&mut Wildcards>) -> Option<RuleId> {
        self.tables
            .get(usize::from(table_id))
            .and_then(|t| t.cls.lookup(flow, wc))
    }

    /// Tag a facet should carry for having looked `flow` up in `table_id`
    /// and found `rule_id` there. `None` for untaggable tables and
    /// catch-all rules.
    #[must_use]
    pub fn lookup_tag(&self, table_id: u8, flow: &Flow, rule_id: RuleId) -> Option<Tag> {
        let table = self.tables.get(usize::from(table_id))?;
        let rule = self.rules.get(&rule_id)?;
        table.tag_for(flow, &rule.m.wc)
    }

    /// Apply a flow mod.
    pub fn modify(&mut self, fm: FlowMod, now: Instant) -> Result<FlowModOutcome, TableError> {
        let table_index = usize::from(fm.table_id);
        if table_index >= self.tables.len() {
            return Err(TableError::NoSuchTable(fm.table_id));
        }
        match fm.command {
            FlowModCommand::Add => self.add(fm, now),
            FlowModCommand::DeleteStrict => Ok(self.delete_strict(&fm)),
        }
    }

    fn change_scope(&self, table_id: u8, flow: &Flow, wc: &Wildcards) -> RevalScope {
        let table = &self.tables[usize::from(table_id)];
        match table.tag_for(flow, wc) {
            Some(tag) => RevalScope::Tags(tag.into()),
            None => RevalScope::All,
        }
    }

    fn find_exact(&self, table_id: u8, m: &Match, priority: u16) -> Option<RuleId> {
        self.rules
            .values()
            .find(|r| {
                r.kind == RuleKind::Normal
                    && r.table_id == table_id
                    && r.priority == priority
                    && r.m == *m
            })
            .map(|r| r.id)
    }

    fn add(&mut self, fm: FlowMod, now: Instant) -> Result<FlowModOutcome, TableError> {
        // An add over an identical match refreshes the rule in place, the
        // way learn actions expect: counters and facets survive, and only
        // an action change needs revalidation.
        if let Some(existing) = self.find_exact(fm.table_id, &fm.m, fm.priority) {
            let scope = self.change_scope(fm.table_id, &fm.m.flow, &fm.m.wc);
            let rule = self
                .rules
                .get_mut(&existing)
                .unwrap_or_else(|| unreachable!());
            let actions_changed = *rule.actions != fm.actions;
            rule.cookie = fm.cookie;
            rule.idle_timeout = fm.idle_timeout;
            rule.hard_timeout = fm.hard_timeout;
            rule.used = Some(now);
            if actions_changed {
                rule.actions = Arc::new(fm.actions);
            }
            return Ok(FlowModOutcome {
                added: Some(existing),
                removed: Vec::new(),
                revalidate: if actions_changed {
                    scope
                } else {
                    RevalScope::Tags(TagSet::default())
                },
            });
        }
        let id = self.alloc_id();
        let rule = Rule {
            id,
            kind: RuleKind::Normal,
            table_id: fm.table_id,
            m: fm.m.clone(),
            priority: fm.priority,
            cookie: fm.cookie,
            idle_timeout: fm.idle_timeout,
            hard_timeout: fm.hard_timeout,
            actions: Arc::new(fm.actions),
            packet_count: 0,
            byte_count: 0,
            created: now,
            used: None,
            facet_flows: std::collections::HashSet::with_hasher(map_hasher()),
        };
        let mut revalidate = self.change_scope(fm.table_id, &fm.m.flow, &fm.m.wc);
        let table = &mut self.tables[usize::from(fm.table_id)];
        let displaced = table.cls.insert(&fm.m, fm.priority, id);
        if table.update_taggable() {
            revalidate = RevalScope::All;
        }
        self.rules.insert(id, rule);
        let mut removed = Vec::new();
        if let Some(old) = displaced {
            if let Some(old_rule) = self.rules.remove(&old) {
                removed.push(old_rule);
            }
        }
        debug!(
            "flow-mod add: table {} priority {} -> {id:?} (displaced {})",
            fm.table_id,
            fm.priority,
            removed.len()
        );
        Ok(FlowModOutcome {
            added: Some(id),
            removed,
            revalidate,
        })
    }

    fn delete_strict(&mut self, fm: &FlowMod) -> FlowModOutcome {
        let target = self.find_exact(fm.table_id, &fm.m, fm.priority);
        let mut outcome = FlowModOutcome {
            added: None,
            removed: Vec::new(),
            revalidate: RevalScope::Tags(TagSet::default()),
        };
        if let Some(id) = target {
            if let Some((rule, scope)) = self.remove_rule(id) {
                outcome.revalidate = scope;
                outcome.removed.push(rule);
            }
        }
        outcome
    }

    /// Unlink and return one rule, with the revalidation its removal needs.
    pub fn remove_rule(&mut self, id: RuleId) -> Option<(Rule, RevalScope)> {
        let rule = self.rules.remove(&id)?;
        if rule.kind != RuleKind::Normal {
            // Synthetic rules are never removed this way; put it back.
            self.rules.insert(id, rule);
            return None;
        }
        let mut scope = self.change_scope(rule.table_id, &rule.m.flow, &rule.m.wc);
        let table = &mut self.tables[usize::from(rule.table_id)];
        table.cls.remove(&rule.m, rule.priority, id);
        if table.update_taggable() {
            scope = RevalScope::All;
        }
        Some((rule, scope))
    }

    /// Remove every normal rule; returns them.
    pub fn flush(&mut self) -> Vec<Rule> {
        let ids: Vec<RuleId> = self
            .rules
            .values()
            .filter(|r| r.kind == RuleKind::Normal)
            .map(|r| r.id)
            .collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((rule, _)) = self.remove_rule(id) {
                out.push(rule);
            }
        }
        out
    }
}
