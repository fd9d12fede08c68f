use async_trait::async_trait;
use sandkeep_core::SandboxRequest;

/// Outcome of a single judge's `pre_admit` call. Evaluation
/// of the chain is strictly sequential; the first non-`Accept` verdict
/// short-circuits the remaining judges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
    Quarantine(String),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// A stage in the admission chain. Mandatory judges (Resource,
/// Network, Audit) are assembled at startup as a fixed
/// `Vec<Box<dyn Judge>>` — no runtime plugin loading.
#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;
    async fn pre_admit(&self, request: &SandboxRequest) -> Verdict;
}

/// Outcome of a post-hoc judge evaluating a terminated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub reason: String,
    pub labels: Vec<String>,
}

/// Rank used to pick the "most restrictive" verdict when merging
/// classifications: Reject outranks Quarantine outranks Accept.
fn restrictiveness(v: &Verdict) -> u8 {
    match v {
        Verdict::Accept => 0,
        Verdict::Quarantine(_) => 1,
        Verdict::Reject(_) => 2,
    }
}

/// Merge post-hoc classifications from every registered post-hoc
/// judge: reason strings concatenate, labels union, and the most
/// restrictive verdict wins.
pub fn merge_classifications(classifications: Vec<Classification>) -> Classification {
    let mut merged = Classification {
        verdict: Verdict::Accept,
        reason: String::new(),
        labels: Vec::new(),
    };

    for c in classifications {
        if restrictiveness(&c.verdict) > restrictiveness(&merged.verdict) {
            merged.verdict = c.verdict.clone();
        }
        if !c.reason.is_empty() {
            if !merged.reason.is_empty() {
                merged.reason.push_str("; ");
            }
            merged.reason.push_str(&c.reason);
        }
        for label in c.labels {
            if !merged.labels.contains(&label) {
                merged.labels.push(label);
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_picks_most_restrictive_verdict() {
        let merged = merge_classifications(vec![
            Classification {
                verdict: Verdict::Accept,
                reason: "clean".into(),
                labels: vec!["scanned".into()],
            },
            Classification {
                verdict: Verdict::Quarantine("suspicious egress".into()),
                reason: "flagged".into(),
                labels: vec!["net-anomaly".into()],
            },
        ]);
        assert_eq!(
            merged.verdict,
            Verdict::Quarantine("suspicious egress".into())
        );
        assert_eq!(merged.reason, "clean; flagged");
        assert_eq!(merged.labels.len(), 2);
    }

    #[test]
    fn merge_unions_labels_without_duplicates() {
        let merged = merge_classifications(vec![
            Classification {
                verdict: Verdict::Accept,
                reason: String::new(),
                labels: vec!["x".into()],
            },
            Classification {
                verdict: Verdict::Accept,
                reason: String::new(),
                labels: vec!["x".into(), "y".into()],
            },
        ]);
        assert_eq!(merged.labels, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn merge_of_empty_list_is_accept() {
        let merged = merge_classifications(vec![]);
        assert_eq!(merged.verdict, Verdict::Accept);
    }
}
