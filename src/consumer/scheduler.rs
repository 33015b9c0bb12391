//! Decides the order queues are offered to FETCH in.
//!
//! Each fetch attempt sends the whole ordering in one `FETCH q1 q2 ...`; the
//! server takes from the first non-empty queue in that order. So the head of
//! the ordering is the queue "selected" for the attempt, and the rest is
//! where the server falls back to when it is empty.
use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::types::job::validate_queue_name;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Priority {
    /// Declared order, every time. A busy first queue starves the rest.
    Strict,
    /// Every queue equally likely to go first.
    #[default]
    Uniform,
    /// Each queue goes first with probability proportional to its weight.
    Weighted,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Priority::Strict => "strict",
            Priority::Uniform => "uniform",
            Priority::Weighted => "weighted",
        })
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(Priority::Strict),
            "uniform" => Ok(Priority::Uniform),
            "weighted" => Ok(Priority::Weighted),
            _ => Err(Error::config(format!(
                "unknown priority {s:?}, expected strict, uniform or weighted"
            ))),
        }
    }
}

pub(crate) struct Scheduler {
    queues: Vec<String>,
    priority: Priority,
    /// One per queue, only for `Weighted`.
    weights: Vec<f64>,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(
        queues: Vec<String>,
        priority: Priority,
        weights: Option<Vec<f64>>,
    ) -> Result<Self> {
        Self::with_rng(queues, priority, weights, StdRng::from_entropy())
    }

    /// A scheduler whose random choices are reproducible.
    pub fn seeded(
        queues: Vec<String>,
        priority: Priority,
        weights: Option<Vec<f64>>,
        seed: u64,
    ) -> Result<Self> {
        Self::with_rng(queues, priority, weights, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        queues: Vec<String>,
        priority: Priority,
        weights: Option<Vec<f64>>,
        rng: StdRng,
    ) -> Result<Self> {
        if queues.is_empty() {
            return Err(Error::config("at least one queue is needed"));
        }
        for q in &queues {
            validate_queue_name(q).map_err(|e| Error::config(e.to_string()))?;
        }

        let weights = match (priority, weights) {
            (Priority::Weighted, Some(weights)) => {
                if weights.len() != queues.len() {
                    return Err(Error::config(format!(
                        "{} weights given for {} queues",
                        weights.len(),
                        queues.len()
                    )));
                }
                let bad = weights.iter().find(|w| !w.is_finite() || **w <= 0.0);
                if let Some(w) = bad {
                    return Err(Error::config(format!(
                        "weight {w} is not a positive number"
                    )));
                }
                weights
            },
            (Priority::Weighted, None) => {
                return Err(Error::config("weighted priority needs weights"))
            },
            (_, Some(_)) => {
                return Err(Error::config(format!(
                    "weights only apply to weighted priority, not {priority}"
                )))
            },
            (_, None) => vec![],
        };

        Ok(Self {
            queues,
            priority,
            weights,
            rng,
        })
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// The queue order for the next fetch attempt.
    pub fn next_order(&mut self) -> Vec<String> {
        match self.priority {
            Priority::Strict => self.queues.clone(),
            Priority::Uniform => {
                let mut order = self.queues.clone();
                order.shuffle(&mut self.rng);
                order
            },
            Priority::Weighted => self.weighted_order(),
        }
    }

    /// Weighted sampling without replacement (Efraimidis-Spirakis): each
    /// queue draws `u^(1/w)` and the largest keys go first. The head is
    /// queue `i` with probability `w_i / sum(w)`.
    fn weighted_order(&mut self) -> Vec<String> {
        let Self {
            queues,
            weights,
            rng,
            ..
        } = self;
        let mut keyed: Vec<(f64, &String)> = queues
            .iter()
            .zip(weights.iter())
            .map(|(q, w)| {
                // (0, 1], so no key is ever zero.
                let u = 1.0 - rng.gen::<f64>();
                (u.powf(w.recip()), q)
            })
            .collect();
        keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
        keyed.into_iter().map(|(_, q)| q.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn names(qs: &[&str]) -> Vec<String> {
        qs.iter().map(|q| (*q).to_owned()).collect()
    }

    fn head_frequencies(
        s: &mut Scheduler,
        rounds: usize,
    ) -> HashMap<String, f64> {
        let mut counts = HashMap::new();
        for _ in 0..rounds {
            let order = s.next_order();
            assert_eq!(order.len(), s.queues().len());
            *counts.entry(order[0].clone()).or_insert(0usize) += 1;
        }
        counts
            .into_iter()
            .map(|(q, n)| (q, n as f64 / rounds as f64))
            .collect()
    }

    #[test]
    fn strict_keeps_declared_order() {
        let declared = names(&["critical", "default", "bulk"]);
        let mut s =
            Scheduler::new(declared.clone(), Priority::Strict, None).unwrap();
        for _ in 0..100 {
            assert_eq!(s.next_order(), declared);
        }
    }

    #[test]
    fn uniform_spreads_evenly() {
        let queues = names(&["a", "b", "c", "d"]);
        let mut s =
            Scheduler::seeded(queues, Priority::Uniform, None, 7).unwrap();
        for (q, f) in head_frequencies(&mut s, 10_000) {
            assert!((f - 0.25).abs() < 0.05, "{q}: {f}");
        }
    }

    #[test]
    fn weighted_converges_to_weight_ratios() {
        let mut s = Scheduler::seeded(
            names(&["hi", "mid", "lo"]),
            Priority::Weighted,
            Some(vec![7.0, 2.0, 1.0]),
            42,
        )
        .unwrap();
        let freq = head_frequencies(&mut s, 10_000);
        assert!((freq["hi"] - 0.7).abs() < 0.05, "{freq:?}");
        assert!((freq["mid"] - 0.2).abs() < 0.05, "{freq:?}");
        assert!((freq["lo"] - 0.1).abs() < 0.05, "{freq:?}");
    }

    #[test]
    fn weighted_orders_are_permutations() {
        let mut s = Scheduler::seeded(
            names(&["a", "b", "c"]),
            Priority::Weighted,
            Some(vec![1.0, 1.0, 5.0]),
            1,
        )
        .unwrap();
        for _ in 0..50 {
            let mut order = s.next_order();
            order.sort();
            assert_eq!(order, names(&["a", "b", "c"]));
        }
    }

    #[test]
    fn bad_configurations() {
        let config = |qs: &[&str], p, w: Option<Vec<f64>>| {
            matches!(Scheduler::new(names(qs), p, w), Err(Error::Config(_)))
        };
        assert!(config(&["a", "b"], Priority::Weighted, Some(vec![1.0])));
        assert!(config(&["a"], Priority::Weighted, None));
        assert!(config(&["a"], Priority::Weighted, Some(vec![0.0])));
        assert!(config(&["a"], Priority::Weighted, Some(vec![f64::NAN])));
        assert!(config(&["a"], Priority::Strict, Some(vec![1.0])));
        assert!(config(&[], Priority::Uniform, None));
        assert!(config(&["no spaces"], Priority::Uniform, None));
    }

    #[test]
    fn priority_names() {
        assert_eq!("weighted".parse::<Priority>().unwrap(), Priority::Weighted);
        assert_eq!(Priority::default().to_string(), "uniform");
        assert!("random".parse::<Priority>().is_err());
    }
}
