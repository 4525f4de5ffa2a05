//! N-ary Snowball.
//!
//! Snowball converges on one of several choices through repeated polls. It
//! prefers the choice with the most successful polls overall, and finalizes
//! once that choice has won enough polls in a row.

use std::collections::HashMap;

use savannah_ids::Id;
use savannah_utils::Bag;

use crate::Parameters;

/// Snowball instance over a set of conflicting choices.
#[derive(Debug, Clone)]
pub struct Snowball {
    alpha: usize,
    beta_virtuous: usize,
    beta_rogue: usize,
    /// Current preference
    preference: Id,
    /// Successful polls recorded for each choice
    preference_strength: HashMap<Id, usize>,
    /// Strength of the current preference
    max_preference_strength: usize,
    /// Choice that won the last successful poll
    snowflake_preference: Id,
    /// Consecutive successful polls for `snowflake_preference`
    confidence: usize,
    /// Whether more than one choice has ever been added
    rogue: bool,
    finalized: bool,
}

impl Snowball {
    /// Creates an instance whose only choice is `choice`.
    pub fn new(params: &Parameters, choice: Id) -> Self {
        Self {
            alpha: params.alpha,
            beta_virtuous: params.beta_virtuous,
            beta_rogue: params.beta_rogue,
            preference: choice,
            preference_strength: HashMap::new(),
            max_preference_strength: 0,
            snowflake_preference: choice,
            confidence: 0,
            rogue: false,
            finalized: false,
        }
    }

    /// Adds a conflicting choice. The instance is rogue from then on.
    pub fn add(&mut self, choice: Id) {
        if !self.finalized && choice != self.preference {
            self.rogue = true;
        }
    }

    pub fn preference(&self) -> Id {
        self.preference
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn confidence(&self) -> usize {
        self.confidence
    }

    pub fn is_rogue(&self) -> bool {
        self.rogue
    }

    /// Applies a poll result. Returns true if the most voted choice reached
    /// alpha.
    pub fn record_poll(&mut self, votes: &Bag<Id>) -> bool {
        match votes.mode() {
            Some((choice, freq)) if freq >= self.alpha => {
                let choice = *choice;
                self.record_successful_poll(choice);
                true
            }
            _ => {
                self.record_unsuccessful_poll();
                false
            }
        }
    }

    pub fn record_successful_poll(&mut self, choice: Id) {
        if self.finalized {
            return;
        }

        let strength = {
            let strength = self.preference_strength.entry(choice).or_insert(0);
            *strength += 1;
            *strength
        };
        if strength > self.max_preference_strength {
            self.preference = choice;
            self.max_preference_strength = strength;
        }

        if choice != self.snowflake_preference {
            self.snowflake_preference = choice;
            self.confidence = 0;
        }
        self.confidence += 1;
        self.finalized = (!self.rogue && self.confidence >= self.beta_virtuous)
            || self.confidence >= self.beta_rogue;
    }

    pub fn record_unsuccessful_poll(&mut self) {
        self.confidence = 0;
    }
}
