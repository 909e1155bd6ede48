// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use fade_nn::{LanguageModel, ParamGroup, PureResult};
use std::collections::BTreeSet;

pub const RETAIN_ADAPTER: &str = "ret_lora";
pub const ADVERSARY_ADAPTER: &str = "adv_lora";
pub const RELEARN_ADAPTER: &str = "relearn_lora";

/// Which parameters may receive gradients during the next forward/backward
/// pair, and which adapters take part in that forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrainableSubset {
    /// Nothing tracks gradients; evaluation passes.
    Frozen,
    /// Intervened weights plus the retain adapter.
    Retain,
    /// Intervened weights only.
    Intervened,
    Adversary,
    Relearn,
}

impl TrainableSubset {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainableSubset::Frozen => "frozen",
            TrainableSubset::Retain => "retain",
            TrainableSubset::Intervened => "intervened",
            TrainableSubset::Adversary => "adversary",
            TrainableSubset::Relearn => "relearn",
        }
    }
}

fn adapter_of(name: &str, adapter: &str) -> bool {
    name.split('.').any(|segment| segment == adapter)
}

/// Partition of a model's parameters into the trainable subsets of one
/// trial. [`SubsetPartition::activate`] is the only place gradient tracking
/// is toggled, so at any time exactly one subset is live.
#[derive(Clone, Debug)]
pub struct SubsetPartition {
    intervened: BTreeSet<String>,
    retain_adapter: BTreeSet<String>,
    adversary: BTreeSet<String>,
    relearn: BTreeSet<String>,
    active: TrainableSubset,
}

impl SubsetPartition {
    /// Classifies the current parameters of `model`. Call again after
    /// attaching or removing adapters.
    pub fn new<'a, M, I>(model: &M, intervened: I) -> PureResult<Self>
    where
        M: LanguageModel + ?Sized,
        I: IntoIterator<Item = &'a str>,
    {
        let mut partition = Self {
            intervened: intervened.into_iter().map(str::to_string).collect(),
            retain_adapter: BTreeSet::new(),
            adversary: BTreeSet::new(),
            relearn: BTreeSet::new(),
            active: TrainableSubset::Frozen,
        };
        model.visit_parameters(&mut |param| {
            let name = param.name();
            if adapter_of(name, RETAIN_ADAPTER) {
                partition.retain_adapter.insert(name.to_string());
            } else if adapter_of(name, ADVERSARY_ADAPTER) {
                partition.adversary.insert(name.to_string());
            } else if adapter_of(name, RELEARN_ADAPTER) {
                partition.relearn.insert(name.to_string());
            }
            Ok(())
        })?;
        Ok(partition)
    }

    pub fn active(&self) -> TrainableSubset {
        self.active
    }

    pub fn has_retain_adapter(&self) -> bool {
        !self.retain_adapter.is_empty()
    }

    pub fn has_adversary(&self) -> bool {
        !self.adversary.is_empty()
    }

    pub fn contains(&self, subset: TrainableSubset, name: &str) -> bool {
        match subset {
            TrainableSubset::Frozen => false,
            TrainableSubset::Retain => {
                self.intervened.contains(name) || self.retain_adapter.contains(name)
            }
            TrainableSubset::Intervened => self.intervened.contains(name),
            TrainableSubset::Adversary => self.adversary.contains(name),
            TrainableSubset::Relearn => self.relearn.contains(name),
        }
    }

    pub fn members(&self, subset: TrainableSubset) -> BTreeSet<String> {
        let mut members = BTreeSet::new();
        for set in [
            &self.intervened,
            &self.retain_adapter,
            &self.adversary,
            &self.relearn,
        ] {
            members.extend(set.iter().filter(|n| self.contains(subset, n)).cloned());
        }
        members
    }

    pub fn intervened_group(&self) -> ParamGroup {
        ParamGroup::new(self.intervened.iter().cloned())
    }

    pub fn retain_adapter_group(&self) -> ParamGroup {
        ParamGroup::new(self.retain_adapter.iter().cloned())
    }

    pub fn adversary_group(&self) -> ParamGroup {
        ParamGroup::new(self.adversary.iter().cloned())
    }

    pub fn relearn_group(&self) -> ParamGroup {
        ParamGroup::new(self.relearn.iter().cloned())
    }

    /// Adapters that take part in forwards run under `subset`.
    pub fn forward_adapters(&self, subset: TrainableSubset) -> Vec<&'static str> {
        let mut adapters = Vec::new();
        match subset {
            TrainableSubset::Relearn => {
                if !self.relearn.is_empty() {
                    adapters.push(RELEARN_ADAPTER);
                }
            }
            TrainableSubset::Retain => {
                if self.has_retain_adapter() {
                    adapters.push(RETAIN_ADAPTER);
                }
            }
            TrainableSubset::Frozen | TrainableSubset::Intervened | TrainableSubset::Adversary => {
                if self.has_retain_adapter() {
                    adapters.push(RETAIN_ADAPTER);
                }
                if self.has_adversary() {
                    adapters.push(ADVERSARY_ADAPTER);
                }
            }
        }
        adapters
    }

    /// Enables gradient tracking on exactly the members of `subset`, selects
    /// its forward adapters, and clears every gradient slot.
    pub fn activate<M>(&mut self, model: &mut M, subset: TrainableSubset) -> PureResult<()>
    where
        M: LanguageModel + ?Sized,
    {
        model.only_grad_on(&|name: &str| self.contains(subset, name))?;
        model.set_active_adapters(&self.forward_adapters(subset))?;
        model.zero_accumulators()?;
        self.active = subset;
        Ok(())
    }

    /// Like [`SubsetPartition::activate`] but with an explicit adapter
    /// selection for the forward pass, used by evaluations that compare
    /// configurations.
    pub fn freeze_with<M>(&mut self, model: &mut M, adapters: &[&str]) -> PureResult<()>
    where
        M: LanguageModel + ?Sized,
    {
        model.only_grad_on(&|_: &str| false)?;
        model.set_active_adapters(adapters)?;
        model.zero_accumulators()?;
        self.active = TrainableSubset::Frozen;
        Ok(())
    }
}
