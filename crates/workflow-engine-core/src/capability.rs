// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability matching: a value-type replacement for mixin/MRO based
//! capability dispatch. Only the data model and scoring survive the
//! port; reflection-based capability discovery is not idiomatic Rust and
//! is not carried over.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CapabilityType {
    CodeGeneration,
    CodeReview,
    CodeRefactoring,
    CodeExplanation,
    TestGeneration,
    TestExecution,
    Documentation,
    ApiDocs,
    StaticAnalysis,
    SecurityAnalysis,
    PerformanceAnalysis,
    TaskDecomposition,
    ArchitectureDesign,
    FileOperations,
    ShellExecution,
    WebSearch,
    Orchestration,
    SelfReflection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,
    pub proficiency: f64,
    #[serde(default)]
    pub requirements: Vec<CapabilityType>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Capability {
    pub fn new(capability_type: CapabilityType, proficiency: f64) -> Self {
        Self {
            capability_type,
            proficiency: proficiency.clamp(0.0, 1.0),
            requirements: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn meets_requirement(&self, required: &Capability) -> bool {
        self.capability_type == required.capability_type && self.proficiency >= required.proficiency
    }
}

/// A set of capabilities an agent or step function advertises, keyed by
/// type so each type appears at most once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub capabilities: BTreeMap<CapabilityType, Capability>,
}

impl CapabilitySet {
    pub fn from_types(types: impl IntoIterator<Item = CapabilityType>) -> Self {
        let mut set = Self::default();
        for t in types {
            set.add(Capability::new(t, 1.0));
        }
        set
    }

    pub fn add(&mut self, capability: Capability) {
        self.capabilities.insert(capability.capability_type, capability);
    }

    pub fn remove(&mut self, capability_type: CapabilityType) -> bool {
        self.capabilities.remove(&capability_type).is_some()
    }

    pub fn has(&self, capability_type: CapabilityType, min_proficiency: f64) -> bool {
        self.capabilities
            .get(&capability_type)
            .map(|c| c.proficiency >= min_proficiency)
            .unwrap_or(false)
    }

    pub fn get(&self, capability_type: CapabilityType) -> Option<&Capability> {
        self.capabilities.get(&capability_type)
    }

    pub fn list_types(&self) -> Vec<CapabilityType> {
        self.capabilities.keys().copied().collect()
    }

    pub fn meets_requirements(&self, required: &CapabilitySet) -> bool {
        required
            .capabilities
            .values()
            .all(|req| self.get(req.capability_type).map(|c| c.meets_requirement(req)).unwrap_or(false))
    }

    pub fn missing_capabilities(&self, required: &CapabilitySet) -> Vec<CapabilityType> {
        required
            .capabilities
            .values()
            .filter(|req| !self.get(req.capability_type).map(|c| c.meets_requirement(req)).unwrap_or(false))
            .map(|req| req.capability_type)
            .collect()
    }

    /// 1.0 if `required` is empty; otherwise the mean, over each required
    /// capability, of `min(1.0, our_proficiency / max(0.01, required_proficiency))`,
    /// with 0 contributed for capabilities we lack entirely.
    pub fn score_match(&self, required: &CapabilitySet) -> f64 {
        if required.capabilities.is_empty() {
            return 1.0;
        }
        let mut total = 0.0;
        for req in required.capabilities.values() {
            total += match self.get(req.capability_type) {
                Some(ours) => (ours.proficiency / req.proficiency.max(0.01)).min(1.0),
                None => 0.0,
            };
        }
        total / required.capabilities.len() as f64
    }
}
