//! 스트림 필터 (스키마/테이블/작업 종류)

use crate::events::ActionKind;
use std::collections::HashSet;

/// 행 이벤트 필터. 빈 집합은 "전체 허용"을 뜻한다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    schemas: HashSet<String>,
    /// `table` 또는 `schema.table`
    tables: HashSet<String>,
    actions: HashSet<ActionKind>,
}

impl StreamFilter {
    pub fn new<S, T, A>(schemas: S, tables: T, actions: A) -> Self
    where
        S: IntoIterator<Item = String>,
        T: IntoIterator<Item = String>,
        A: IntoIterator<Item = ActionKind>,
    {
        StreamFilter {
            schemas: schemas.into_iter().collect(),
            tables: tables.into_iter().collect(),
            actions: actions.into_iter().collect(),
        }
    }

    /// 모든 이벤트 허용
    pub fn allow_all() -> Self {
        StreamFilter::default()
    }

    pub fn includes_schema(&self, schema: &str) -> bool {
        self.schemas.is_empty() || self.schemas.contains(schema)
    }

    pub fn includes_table(&self, schema: &str, table: &str) -> bool {
        if !self.includes_schema(schema) {
            return false;
        }
        self.tables.is_empty()
            || self.tables.contains(table)
            || self.tables.contains(&format!("{}.{}", schema, table))
    }

    pub fn includes_action(&self, action: ActionKind) -> bool {
        self.actions.is_empty() || self.actions.contains(&action)
    }

    pub fn includes(&self, schema: &str, table: &str, action: ActionKind) -> bool {
        self.includes_table(schema, table) && self.includes_action(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = StreamFilter::allow_all();
        assert!(filter.includes("any", "table", ActionKind::Delete));
    }

    #[test]
    fn test_schema_allow_list() {
        let filter = StreamFilter::new(vec!["shop".to_string()], Vec::new(), ActionKind::ALL);
        assert!(filter.includes("shop", "orders", ActionKind::Insert));
        assert!(!filter.includes("billing", "orders", ActionKind::Insert));
    }

    #[test]
    fn test_table_names_bare_and_qualified() {
        let filter = StreamFilter::new(
            Vec::new(),
            vec!["orders".to_string(), "billing.invoices".to_string()],
            ActionKind::ALL,
        );
        assert!(filter.includes_table("shop", "orders"));
        assert!(filter.includes_table("billing", "invoices"));
        assert!(!filter.includes_table("shop", "invoices"));
    }

    #[test]
    fn test_action_filter() {
        let filter = StreamFilter::new(Vec::new(), Vec::new(), vec![ActionKind::Insert]);
        assert!(filter.includes_action(ActionKind::Insert));
        assert!(!filter.includes("shop", "orders", ActionKind::Delete));
    }
}
