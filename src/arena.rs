/// Arena aggregation: N x N cross-review scores into rankings and a
/// per-vendor shortlist.
///
/// Reviews are on the 1..10 scale. Self-reviews are excluded before any
/// averaging. Ranking order is mean combined score descending, then
/// review count descending, then model id ascending, so the snapshot is
/// independent of input order.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One reviewer's verdict on one submitter's strategy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossEvaluation {
    pub reviewer: String,
    pub submitter: String,
    #[serde(rename = "strategy")]
    pub strategy_id: String,
    /// Spec fidelity, 1..10.
    pub d1: f64,
    /// Risk discipline, 1..10.
    pub d2: f64,
    #[serde(default)]
    pub comment: String,
}

impl CrossEvaluation {
    pub fn is_self_review(&self) -> bool {
        self.reviewer == self.submitter
    }
}

/// Aggregated standing of one submitter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelRanking {
    pub submitter: String,
    pub mean_d1: f64,
    pub mean_d2: f64,
    pub mean_combined: f64,
    pub review_count: usize,
    /// 1-based position after sorting.
    pub rank: usize,
}

/// Rankings for one strategy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub strategy_id: String,
    pub rankings: Vec<ModelRanking>,
}

/// Aggregate cross-evaluations for one strategy. Submitters listed in
/// `participants` but receiving no peer reviews still appear, with zero
/// scores, so the shortlist never silently drops a model.
pub fn aggregate(
    strategy_id: &str,
    participants: &[String],
    evaluations: &[CrossEvaluation],
) -> RankingSnapshot {
    let mut per_submitter: BTreeMap<&str, Vec<&CrossEvaluation>> = BTreeMap::new();
    for id in participants {
        per_submitter.entry(id.as_str()).or_default();
    }
    for eval in evaluations {
        if eval.strategy_id != strategy_id || eval.is_self_review() {
            continue;
        }
        per_submitter.entry(eval.submitter.as_str()).or_default().push(eval);
    }

    let mut rankings: Vec<ModelRanking> = per_submitter
        .into_iter()
        .map(|(submitter, reviews)| {
            let count = reviews.len();
            let (mut d1, mut d2) = (0.0, 0.0);
            for r in &reviews {
                d1 += r.d1;
                d2 += r.d2;
            }
            if count > 0 {
                d1 /= count as f64;
                d2 /= count as f64;
            }
            ModelRanking {
                submitter: submitter.to_string(),
                mean_d1: d1,
                mean_d2: d2,
                mean_combined: (d1 + d2) / 2.0,
                review_count: count,
                rank: 0,
            }
        })
        .collect();

    rankings.sort_by(|a, b| {
        b.mean_combined
            .total_cmp(&a.mean_combined)
            .then(b.review_count.cmp(&a.review_count))
            .then(a.submitter.cmp(&b.submitter))
    });
    for (i, r) in rankings.iter_mut().enumerate() {
        r.rank = i + 1;
    }

    RankingSnapshot {
        strategy_id: strategy_id.to_string(),
        rankings,
    }
}

/// Vendor of a model id: explicit roster entry first, then a substring
/// classifier over well-known id families.
pub fn vendor_of(model_id: &str, overrides: &BTreeMap<String, String>) -> String {
    if let Some(vendor) = overrides.get(model_id) {
        return vendor.clone();
    }
    let id = model_id.to_ascii_lowercase();
    let families: [(&[&str], &str); 7] = [
        (&["gpt", "o3", "o1"], "OpenAI"),
        (&["claude"], "Anthropic"),
        (&["gemini"], "Google"),
        (&["deepseek", "doubao", "ark"], "DeepSeek/Ark"),
        (&["qwen", "fireworks"], "Qwen/Fireworks"),
        (&["glm"], "GLM"),
        (&["grok"], "xAI/Grok"),
    ];
    for (needles, vendor) in families {
        if needles.iter().any(|n| id.contains(n)) {
            return vendor.to_string();
        }
    }
    "Others".to_string()
}

/// Entry of the published shortlist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShortlistEntry {
    pub vendor: String,
    pub model_id: String,
    pub mean_combined: f64,
    pub rank: usize,
}

/// Best-ranked model per vendor, at most `top_n` entries, ordered by
/// overall rank.
pub fn select_shortlist(
    snapshot: &RankingSnapshot,
    vendor_overrides: &BTreeMap<String, String>,
    top_n: usize,
) -> Vec<ShortlistEntry> {
    let mut seen_vendors = std::collections::BTreeSet::new();
    let mut shortlist = Vec::new();
    // Rankings are already rank-ordered, so the first model of each
    // vendor is that vendor's best.
    for ranking in &snapshot.rankings {
        let vendor = vendor_of(&ranking.submitter, vendor_overrides);
        if !seen_vendors.insert(vendor.clone()) {
            continue;
        }
        shortlist.push(ShortlistEntry {
            vendor,
            model_id: ranking.submitter.clone(),
            mean_combined: ranking.mean_combined,
            rank: ranking.rank,
        });
        if shortlist.len() == top_n {
            break;
        }
    }
    shortlist
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(reviewer: &str, submitter: &str, d1: f64, d2: f64) -> CrossEvaluation {
        CrossEvaluation {
            reviewer: reviewer.to_string(),
            submitter: submitter.to_string(),
            strategy_id: "s1".to_string(),
            d1,
            d2,
            comment: String::new(),
        }
    }

    fn participants(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_self_reviews_excluded_from_means() {
        let evals = vec![
            eval("m1", "m1", 10.0, 10.0),
            eval("m2", "m1", 8.0, 8.0),
            eval("m1", "m2", 6.0, 4.0),
        ];
        let snapshot = aggregate("s1", &participants(&["m1", "m2"]), &evals);
        let m1 = snapshot.rankings.iter().find(|r| r.submitter == "m1").unwrap();
        assert_eq!(m1.review_count, 1);
        assert!((m1.mean_d1 - 8.0).abs() < 1e-12);
        let m2 = snapshot.rankings.iter().find(|r| r.submitter == "m2").unwrap();
        assert!((m2.mean_combined - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_ranking_is_input_order_invariant() {
        let mut evals = vec![
            eval("a", "m1", 7.0, 7.0),
            eval("b", "m1", 9.0, 9.0),
            eval("a", "m2", 8.0, 8.0),
            eval("b", "m2", 8.0, 8.0),
        ];
        let forward = aggregate("s1", &participants(&["m1", "m2"]), &evals);
        evals.reverse();
        let backward = aggregate("s1", &participants(&["m1", "m2"]), &evals);
        assert_eq!(
            serde_json::to_string(&forward).unwrap(),
            serde_json::to_string(&backward).unwrap()
        );
        // Tie on combined mean (8.0): both have 2 reviews, so model id
        // breaks the tie.
        assert_eq!(forward.rankings[0].submitter, "m1");
        assert_eq!(forward.rankings[0].rank, 1);
    }

    #[test]
    fn test_unreviewed_participant_kept_with_zero_scores() {
        let evals = vec![eval("m1", "m2", 9.0, 9.0)];
        let snapshot = aggregate("s1", &participants(&["m1", "m2", "m3"]), &evals);
        let m3 = snapshot.rankings.iter().find(|r| r.submitter == "m3").unwrap();
        assert_eq!(m3.review_count, 0);
        assert_eq!(m3.mean_combined, 0.0);
        assert_eq!(snapshot.rankings.len(), 3);
    }

    #[test]
    fn test_other_strategy_reviews_ignored() {
        let mut foreign = eval("m1", "m2", 10.0, 10.0);
        foreign.strategy_id = "other".to_string();
        let snapshot = aggregate("s1", &participants(&["m2"]), &[foreign]);
        assert_eq!(snapshot.rankings[0].review_count, 0);
    }

    #[test]
    fn test_vendor_classifier_and_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("house-model".to_string(), "Homegrown".to_string());
        assert_eq!(vendor_of("house-model", &overrides), "Homegrown");
        assert_eq!(vendor_of("gpt-5.2", &overrides), "OpenAI");
        assert_eq!(vendor_of("claude-sonnet", &overrides), "Anthropic");
        assert_eq!(vendor_of("Gemini-Pro", &overrides), "Google");
        assert_eq!(vendor_of("mystery-7b", &overrides), "Others");
    }

    #[test]
    fn test_shortlist_takes_best_per_vendor() {
        let evals = vec![
            eval("x", "gpt-a", 9.0, 9.0),
            eval("x", "gpt-b", 7.0, 7.0),
            eval("x", "claude-a", 8.0, 8.0),
            eval("x", "mystery", 6.0, 6.0),
        ];
        let snapshot = aggregate(
            "s1",
            &participants(&["gpt-a", "gpt-b", "claude-a", "mystery"]),
            &evals,
        );
        let shortlist = select_shortlist(&snapshot, &BTreeMap::new(), 10);
        let vendors: Vec<&str> = shortlist.iter().map(|e| e.vendor.as_str()).collect();
        assert_eq!(vendors, vec!["OpenAI", "Anthropic", "Others"]);
        assert_eq!(shortlist[0].model_id, "gpt-a");

        let capped = select_shortlist(&snapshot, &BTreeMap::new(), 2);
        assert_eq!(capped.len(), 2);
    }
}
