//! 쿼리 해석 - 정확 일치 후보(청구 코드, DIN) 추출

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// 쿼리에서 읽어낸 정확 일치 힌트
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryInterpretation {
    /// 청구 코드 (예: C122, A007)
    pub billing_codes: Vec<String>,
    /// 8자리 약품 식별 번호
    pub drug_ids: Vec<String>,
}

impl QueryInterpretation {
    /// structured 저장소에 넘길 자연키 후보
    pub fn key_hints(&self) -> Vec<String> {
        self.billing_codes
            .iter()
            .chain(self.drug_ids.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.billing_codes.is_empty() && self.drug_ids.is_empty()
    }
}

impl fmt::Display for QueryInterpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.billing_codes.is_empty() {
            parts.push(format!("billing codes: {}", self.billing_codes.join(", ")));
        }
        if !self.drug_ids.is_empty() {
            parts.push(format!("drug ids: {}", self.drug_ids.join(", ")));
        }
        if parts.is_empty() {
            f.write_str("free-text query")
        } else {
            f.write_str(&parts.join("; "))
        }
    }
}

/// 쿼리 해석
pub fn interpret_query(query: &str) -> QueryInterpretation {
    static CODE: OnceLock<Regex> = OnceLock::new();
    static DIN: OnceLock<Regex> = OnceLock::new();
    let code = CODE.get_or_init(|| Regex::new(r"\b[A-Za-z]\d{3}[A-Za-z]?\b").expect("Invalid regex"));
    let din = DIN.get_or_init(|| Regex::new(r"\b\d{8}\b").expect("Invalid regex"));

    let mut interpretation = QueryInterpretation::default();
    for m in code.find_iter(query) {
        let value = m.as_str().to_uppercase();
        if !interpretation.billing_codes.contains(&value) {
            interpretation.billing_codes.push(value);
        }
    }
    for m in din.find_iter(query) {
        let value = m.as_str().to_string();
        if !interpretation.drug_ids.contains(&value) {
            interpretation.drug_ids.push(value);
        }
    }
    interpretation
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_codes_and_dins() {
        let q = interpret_query("Can I bill c122 with A007? DIN 02247701 coverage");
        assert_eq!(q.billing_codes, vec!["C122", "A007"]);
        assert_eq!(q.drug_ids, vec!["02247701"]);
        assert_eq!(q.to_string(), "billing codes: C122, A007; drug ids: 02247701");
    }

    #[test]
    fn test_free_text_query() {
        let q = interpret_query("day following hospital admission");
        assert!(q.is_empty());
        assert_eq!(q.to_string(), "free-text query");
    }
}
