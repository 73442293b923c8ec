// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tuple-space classifier.
//!
//! Rules are bucketed by mask shape: one subtable per distinct
//! [`Minimask`], each keyed by the masked flow. Lookup probes every
//! subtable and keeps the highest-priority hit. Every probed subtable's
//! mask is folded into the caller's wildcards whether it hit or not —
//! a megaflow must be narrow enough to repeat the *whole* lookup
//! verbatim, including the misses.

use std::collections::HashMap;

use flow::{Flow, Miniflow, Minimask, Wildcards, map_hasher};

use crate::rule::RuleId;

/// A (flow, mask) match pair as rules carry it.
#[derive(Clone, Debug, PartialEq)]
pub struct Match {
    pub flow: Flow,
    pub wc: Wildcards,
}

impl Match {
    /// Match-everything.
    #[must_use]
    pub fn catchall() -> Match {
        Match {
            flow: Flow::default(),
            wc: Wildcards::catchall(),
        }
    }
}

struct Subtable {
    mask: Minimask,
    /// Masked flow → (priority desc, rule) list.
    rules: HashMap<Miniflow, Vec<(u16, RuleId)>, ahash::RandomState>,
    n_rules: usize,
}

/// One table's worth of rules.
#[derive(Default)]
pub struct Classifier {
    subtables: Vec<Subtable>,
    n_rules: usize,
}

impl Classifier {
    #[must_use]
    pub fn new() -> Classifier {
        Classifier::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n_rules == 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.n_rules
    }

    /// Distinct mask shapes currently present.
    pub fn subtable_masks(&self) -> impl Iterator<Item = &Minimask> {
        self.subtables.iter().map(|s| &s.mask)
    }

    /// Insert a rule; returns the rule it displaced, if any (same mask,
    /// same masked flow, same priority).
    pub fn insert(
        &mut self,
        m: &Match,
        priority: u16,
        id: RuleId,
    ) -> Option<RuleId> {
        let mask = Minimask::from_wildcards(&m.wc);
        let key = Miniflow::from_flow_in_minimask(&m.flow, &mask);
        let subtable = match self.subtables.iter_mut().find(|s| s.mask == mask) {
            Some(s) => s,
            None => {
                self.subtables.push(Subtable {
                    mask,
                    rules: HashMap::with_hasher(map_hasher()),
                    n_rules: 0,
                });
                self.subtables.last_mut().unwrap_or_else(|| unreachable!())
            }
        };
        let list = subtable.rules.entry(key).or_default();
        if let Some(slot) = list.iter_mut().find(|(p, _)| *p == priority) {
            let old = slot.1;
            slot.1 = id;
            return Some(old);
        }
        let at = list.partition_point(|(p, _)| *p > priority);
        list.insert(at, (priority, id));
        subtable.n_rules += 1;
        self.n_rules += 1;
        None
    }

    /// Remove a rule previously inserted with exactly this match/priority.
    pub fn remove(&mut self, m: &Match, priority: u16, id: RuleId) {
        let mask = Minimask::from_wildcards(&m.wc);
        let key = Miniflow::from_flow_in_minimask(&m.flow, &mask);
        let Some(at) = self.subtables.iter().position(|s| s.mask == mask) else {
            return;
        };
        let subtable = &mut self.subtables[at];
        if let Some(list) = subtable.rules.get_mut(&key) {
            let before = list.len();
            list.retain(|(p, r)| !(*p == priority && *r == id));
            let removed = before - list.len();
            if list.is_empty() {
                subtable.rules.remove(&key);
            }
            subtable.n_rules -= removed;
            self.n_rules -= removed;
        }
        if subtable.n_rules == 0 {
            self.subtables.swap_remove(at);
        }
    }

    /// Highest-priority rule matching `flow`. When `wc` is given, the masks
    /// of every probed subtable are folded into it.
    #[must_use]
    pub fn lookup(&self, flow: &Flow, mut wc: Option<&mut Wildcards>) -> Option<RuleId> {
        let mut best: Option<(u16, RuleId)> = None;
        for subtable in &self.subtables {
            if let Some(wc) = wc.as_deref_mut() {
                wc.fold(&subtable.mask.expand());
            }
            let key = Miniflow::from_flow_in_minimask(flow, &subtable.mask);
            if let Some(list) = subtable.rules.get(&key) {
                if let Some(&(priority, id)) = list.first() {
                    if best.is_none_or(|(bp, _)| priority > bp) {
                        best = Some((priority, id));
                    }
                }
            }
        }
        best.map(|(_, id)| id)
    }

    /// Every rule in the classifier, unordered.
    pub fn iter(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.subtables
            .iter()
            .flat_map(|s| s.rules.values())
            .flat_map(|list| list.iter().map(|(_, id)| *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow::{ETH_TYPE_IP, EthAddr, OfPort};

    fn match_on_port(port: u16) -> Match {
        let mut m = Match::catchall();
        m.flow.in_port = OfPort(port);
        m.wc.masks.in_port = OfPort(u16::MAX);
        m
    }

    fn match_on_dst(dst: EthAddr) -> Match {
        let mut m = Match::catchall();
        m.flow.dl_dst = dst;
        m.wc.masks.dl_dst = EthAddr::BROADCAST;
        m
    }

    #[test]
    fn priority_wins_across_subtables() {
        let mut cls = Classifier::new();
        cls.insert(&match_on_port(1), 10, RuleId(1));
        cls.insert(&match_on_dst(EthAddr([1, 1, 1, 1, 1, 1])), 20, RuleId(2));

        let f = Flow {
            in_port: OfPort(1),
            dl_dst: EthAddr([1, 1, 1, 1, 1, 1]),
            ..Flow::default()
        };
        assert_eq!(cls.lookup(&f, None), Some(RuleId(2)));

        let f2 = Flow {
            in_port: OfPort(1),
            ..Flow::default()
        };
        assert_eq!(cls.lookup(&f2, None), Some(RuleId(1)));
    }

    #[test]
    fn lookup_folds_all_probed_masks() {
        let mut cls = Classifier::new();
        cls.insert(&match_on_port(1), 10, RuleId(1));
        cls.insert(&match_on_dst(EthAddr([1, 1, 1, 1, 1, 1])), 5, RuleId(2));

        let f = Flow {
            in_port: OfPort(1),
            ..Flow::default()
        };
        let mut wc = Wildcards::catchall();
        cls.lookup(&f, Some(&mut wc));
        // Both subtables probed, both masks folded.
        assert_eq!(wc.masks.in_port, OfPort(u16::MAX));
        assert_eq!(wc.masks.dl_dst, EthAddr::BROADCAST);
    }

    #[test]
    fn replace_same_priority() {
        let mut cls = Classifier::new();
        assert_eq!(cls.insert(&match_on_port(1), 10, RuleId(1)), None);
        assert_eq!(cls.insert(&match_on_port(1), 10, RuleId(2)), Some(RuleId(1)));
        assert_eq!(cls.len(), 1);
        let f = Flow {
            in_port: OfPort(1),
            ..Flow::default()
        };
        assert_eq!(cls.lookup(&f, None), Some(RuleId(2)));
    }

    #[test]
    fn remove_cleans_empty_subtables() {
        let mut cls = Classifier::new();
        cls.insert(&match_on_port(1), 10, RuleId(1));
        assert_eq!(cls.subtable_masks().count(), 1);
        cls.remove(&match_on_port(1), 10, RuleId(1));
        assert!(cls.is_empty());
        assert_eq!(cls.subtable_masks().count(), 0);
    }

    #[test]
    fn same_key_orders_by_priority() {
        let mut cls = Classifier::new();
        cls.insert(&match_on_port(1), 1, RuleId(1));
        cls.insert(&match_on_port(1), 100, RuleId(2));
        cls.insert(&match_on_port(1), 50, RuleId(3));
        let f = Flow {
            in_port: OfPort(1),
            ..Flow::default()
        };
        assert_eq!(cls.lookup(&f, None), Some(RuleId(2)));
    }

    #[test]
    fn catchall_rule_matches_everything() {
        let mut cls = Classifier::new();
        cls.insert(&Match::catchall(), 0, RuleId(9));
        let f = Flow {
            dl_type: ETH_TYPE_IP,
            ..Flow::default()
        };
        assert_eq!(cls.lookup(&f, None), Some(RuleId(9)));
    }
}
