//! 検索結果の厳密一致フィルタ
//!
//! ログブックの検索は部分一致なので、完全一致が必要な場合はクライアント側で絞り込む。
//! サーバが返した結果を狭めるだけで、除外された結果を取り戻すことはない。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::SearchCriteria;
use crate::logbook::SearchResult;

/// 厳密一致フィルタの設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterPolicy {
    pub enabled: bool,
    /// 大文字小文字を区別する
    pub case_sensitive: bool,
    /// 比較前に前後の空白を除去する
    pub trim_whitespace: bool,
    /// 検索条件キー → 結果フィールド名。空なら同名フィールドを比較する
    pub fields: BTreeMap<String, String>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            case_sensitive: true,
            trim_whitespace: false,
            fields: BTreeMap::new(),
        }
    }
}

impl FilterPolicy {
    pub fn strict() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_field(mut self, criteria_key: impl Into<String>, result_field: impl Into<String>) -> Self {
        self.fields.insert(criteria_key.into(), result_field.into());
        self
    }

    fn values_match(&self, expected: &str, actual: &str) -> bool {
        let (expected, actual) = if self.trim_whitespace {
            (expected.trim(), actual.trim())
        } else {
            (expected, actual)
        };

        if self.case_sensitive {
            expected == actual
        } else {
            expected.to_lowercase() == actual.to_lowercase()
        }
    }

    /// エントリを残すかどうか
    pub fn matches(&self, criteria: &SearchCriteria, result: &SearchResult) -> bool {
        if self.fields.is_empty() {
            // 結果側に存在するフィールドだけが比較対象
            criteria.iter().all(|(key, expected)| match result.field(key) {
                Some(actual) => self.values_match(expected, actual),
                None => true,
            })
        } else {
            self.fields.iter().all(|(key, field)| match criteria.get(key) {
                Some(expected) => result
                    .field(field)
                    .map(|actual| self.values_match(expected, actual))
                    .unwrap_or(false),
                None => true,
            })
        }
    }

    /// 無効時はそのまま返す。順序は保持する
    pub fn apply(&self, criteria: &SearchCriteria, results: Vec<SearchResult>) -> Vec<SearchResult> {
        if !self.enabled {
            return results;
        }
        results
            .into_iter()
            .filter(|result| self.matches(criteria, result))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nps_results() -> Vec<SearchResult> {
        vec![
            SearchResult::new("1", "Run 4001", "u1").with_field("run_period", "NPS-extended"),
            SearchResult::new("2", "Run 4002", "u2").with_field("run_period", "NPS"),
        ]
    }

    #[test]
    fn test_disabled_passes_everything() {
        let criteria = SearchCriteria::new().with("run_period", "NPS");
        let kept = FilterPolicy::default().apply(&criteria, nps_results());
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_strict_keeps_exact_match_only() {
        let criteria = SearchCriteria::new().with("run_period", "NPS");
        let kept = FilterPolicy::strict().apply(&criteria, nps_results());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "2");
    }

    #[test]
    fn test_fields_absent_from_result_do_not_participate() {
        let criteria = SearchCriteria::new()
            .with("run_period", "NPS")
            .with("start_date", "2023-09-01 00:00");
        let kept = FilterPolicy::strict().apply(&criteria, nps_results());
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_explicit_field_mapping() {
        let criteria = SearchCriteria::new().with("search_str", "Run 4002");
        let policy = FilterPolicy::strict().with_field("search_str", "title");
        let kept = policy.apply(&criteria, nps_results());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "2");

        // マッピング先フィールドが無いエントリは不一致
        let policy = FilterPolicy::strict().with_field("search_str", "subject");
        assert!(policy.apply(&criteria, nps_results()).is_empty());
    }

    #[test]
    fn test_case_and_whitespace_options() {
        let criteria = SearchCriteria::new().with("run_period", "nps");
        let results = vec![SearchResult::new("1", "t", "u").with_field("run_period", " NPS ")];

        assert!(FilterPolicy::strict().apply(&criteria, results.clone()).is_empty());

        let relaxed = FilterPolicy {
            case_sensitive: false,
            trim_whitespace: true,
            ..FilterPolicy::strict()
        };
        assert_eq!(relaxed.apply(&criteria, results).len(), 1);
    }
}
