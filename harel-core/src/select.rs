//! Transition selection.

use crate::error::CoreError;
use crate::event::{is_wildcard, matches_descriptor, Event};
use crate::guard::GuardEvaluator;
use crate::machine::Machine;
use crate::node::{NodeIndex, TransitionDef};
use crate::resolve::Configuration;
use serde_json::Value;

impl Machine {
    /// Selects the enabled transitions for `event` (or the eventless
    /// transitions when `eventless` is set).
    ///
    /// Each active leaf walks up its ancestor chain; the first node with a
    /// candidate whose guard passes supplies that leaf's transition, so
    /// inner definitions shadow outer ones. Selections from different leaves
    /// are deduplicated and checked for overlapping exit sets.
    pub(crate) fn select(
        &self,
        config: &Configuration,
        event: &Event,
        eventless: bool,
        ctx: &Value,
    ) -> Result<Vec<&TransitionDef>, CoreError> {
        let mut selected: Vec<&TransitionDef> = Vec::new();

        for &leaf in config.iter().filter(|&&i| self.node(i).is_leaf()) {
            let chain = std::iter::once(leaf).chain(self.ancestors(leaf));
            'chain: for node in chain {
                for candidate in self.candidates(node, event, eventless) {
                    let enabled = GuardEvaluator::evaluate_opt(
                        candidate.guard.as_ref(),
                        self.implementations(),
                        ctx,
                        event,
                    )?;
                    if enabled {
                        if !selected.iter().any(|t| std::ptr::eq(*t, candidate)) {
                            selected.push(candidate);
                        }
                        break 'chain;
                    }
                }
            }
        }

        self.check_conflicts(config, &selected)?;
        Ok(selected)
    }

    /// Candidates declared on `node`: exact descriptors first, then
    /// wildcards, each in declared order.
    fn candidates<'m>(
        &'m self,
        node: NodeIndex,
        event: &Event,
        eventless: bool,
    ) -> Vec<&'m TransitionDef> {
        let node = self.node(node);
        if eventless {
            return node.always.iter().collect();
        }
        let exact = node
            .on
            .iter()
            .filter(|(d, _)| *d == event.event_type)
            .flat_map(|(_, ts)| ts.iter());
        let wildcard = node
            .on
            .iter()
            .filter(|(d, _)| is_wildcard(d) && matches_descriptor(d, &event.event_type))
            .flat_map(|(_, ts)| ts.iter());
        exact.chain(wildcard).collect()
    }

    fn check_conflicts(
        &self,
        config: &Configuration,
        selected: &[&TransitionDef],
    ) -> Result<(), CoreError> {
        let exit_sets: Vec<Configuration> = selected
            .iter()
            .map(|t| self.exit_set(t, config))
            .collect();
        for (i, first) in exit_sets.iter().enumerate() {
            for (j, second) in exit_sets.iter().enumerate().skip(i + 1) {
                if !first.is_disjoint(second) {
                    return Err(CoreError::ConflictingTransitions {
                        first: selected[i].label.clone(),
                        second: selected[j].label.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Lowest node whose subtree bounds the transition's exits and entries.
    ///
    /// A transition targeting its own source exits and re-enters it. Only
    /// targets strictly inside the source keep the source active, unless the
    /// transition is marked `reenter`.
    ///
    /// Returns `None` when the domain lies above the root, which only
    /// happens for transitions that exit the root itself.
    pub(crate) fn transition_domain(&self, transition: &TransitionDef) -> Option<NodeIndex> {
        let source = transition.source;
        let Some(targets) = transition.targets.as_deref() else {
            return Some(source);
        };

        if !transition.reenter && targets.iter().all(|&t| self.is_descendant(t, source)) {
            return Some(source);
        }

        let first = targets.first().copied().unwrap_or(source);
        let lcca = self.ancestors(first).find(|&ancestor| {
            self.is_descendant(source, ancestor)
                && targets.iter().all(|&t| self.is_descendant(t, ancestor))
        });
        match lcca {
            Some(domain) => Some(domain),
            None if transition.reenter => None,
            None => Some(crate::node::ROOT),
        }
    }

    /// Active nodes the transition exits, in document order.
    pub(crate) fn exit_set(&self, transition: &TransitionDef, config: &Configuration) -> Configuration {
        if transition.is_targetless() {
            return Configuration::new();
        }
        match self.transition_domain(transition) {
            Some(domain) => config
                .iter()
                .copied()
                .filter(|&n| self.is_descendant(n, domain))
                .collect(),
            None => config.clone(),
        }
    }
}
