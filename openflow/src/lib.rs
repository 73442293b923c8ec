// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(unsafe_code)]

//! # OpenFlow rule machinery
//!
//! The action set as one exhaustive tagged union ([`OfAction`]), the
//! meta-field registry behind register/learn actions ([`MetaField`],
//! [`Subfield`]), the rule arena and per-bridge rule tables with a
//! tuple-space classifier, and the revalidation-tag scheme tables use to
//! keep flow-mod fallout narrow.

mod action;
mod classifier;
mod field;
mod rule;
mod table;
mod tag;

pub use action::{LearnDst, LearnFieldSpec, LearnSpec, LearnSrc, OfAction, PacketInReason};
pub use classifier::{Classifier, Match};
pub use field::{MetaField, Subfield};
pub use rule::{FlowMod, FlowModCommand, Rule, RuleId, RuleKind};
pub use table::{FlowModOutcome, N_TABLES, RevalScope, RuleTable, TableError};
pub use tag::{Tag, TagSet};
