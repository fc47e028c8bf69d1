//! Fuzzy filename scoring for `fuzzy_find`.

use nucleo_matcher::Matcher;
use nucleo_matcher::Utf32Str;
use nucleo_matcher::pattern::AtomKind;
use nucleo_matcher::pattern::CaseMatching;
use nucleo_matcher::pattern::Normalization;
use nucleo_matcher::pattern::Pattern;

/// Minimum normalized score (0–100) a candidate must reach to be reported.
pub const SCORE_CUTOFF: u32 = 40;

/// Rank `candidates` against `query`, strongest first. Scores are
/// normalized to 0–100 against the query's self-match score so the cutoff
/// has a stable meaning regardless of query length.
pub fn rank(
    query: &str,
    candidates: impl IntoIterator<Item = String>,
    limit: usize,
) -> Vec<(String, u32)> {
    let mut matcher = Matcher::new(nucleo_matcher::Config::DEFAULT);
    let pattern = Pattern::new(
        query,
        CaseMatching::Ignore,
        Normalization::Smart,
        AtomKind::Fuzzy,
    );

    let mut buf = Vec::new();
    let self_score = pattern
        .score(Utf32Str::new(query, &mut buf), &mut matcher)
        .unwrap_or(1)
        .max(1);

    let mut scored: Vec<(String, u32)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let mut buf = Vec::new();
            let raw = pattern.score(Utf32Str::new(&candidate, &mut buf), &mut matcher)?;
            let normalized = ((raw as u64 * 100) / self_score as u64).min(100) as u32;
            (normalized >= SCORE_CUTOFF).then_some((candidate, normalized))
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_name_scores_highest() {
        let files = vec![
            "src/App.tsx".to_string(),
            "src/components/Button.tsx".to_string(),
            "README.md".to_string(),
        ];
        let ranked = rank("App", files, 10);
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].0, "src/App.tsx");
        assert!(ranked[0].1 >= SCORE_CUTOFF);
    }

    #[test]
    fn unrelated_names_fall_below_cutoff() {
        let files = vec!["Cargo.lock".to_string(), "zzz.bin".to_string()];
        let ranked = rank("ButtonComponent", files, 10);
        assert!(ranked.is_empty());
    }

    #[test]
    fn limit_is_respected() {
        let files: Vec<String> = (0..30).map(|i| format!("src/page{i}.tsx")).collect();
        let ranked = rank("page", files, 10);
        assert!(ranked.len() <= 10);
    }
}
