//! The backend dialect capability record.
//!
//! A [`Dialect`] is a plain configuration struct -- capability booleans,
//! limits, a semantic-type -> column-keyword mapping with an optional
//! override hook, and statement templates with fixed placeholder tokens.
//! One is selected at store open; the engine renders every structural
//! statement through it and hardcodes no backend keyword itself.

use strata_core::SemanticType;

/// Placeholder tokens used in the statement templates.
const TOKEN_TABLE: &str = "{table}";
const TOKEN_OLD: &str = "{old}";
const TOKEN_NEW: &str = "{new}";
const TOKEN_INDEX: &str = "{index}";
const TOKEN_LIMIT: &str = "{limit}";
const TOKEN_OFFSET: &str = "{offset}";

/// Capability record for one SQL backend.
#[derive(Clone)]
pub struct Dialect {
    pub name: &'static str,

    /// Maximum identifier length; generated names are truncated from the
    /// front to fit.
    pub max_identifier_len: usize,
    /// Maximum total row size in bytes, advisory.
    pub max_row_bytes: usize,

    /// Backend assigns primary keys on insert. Without it the store
    /// allocates ids itself.
    pub supports_identity: bool,
    pub supports_exists: bool,
    /// Backend can join inside an UPDATE (correlated data-copy steps).
    pub supports_join_update: bool,
    pub can_rename_column: bool,
    pub can_retype_column: bool,
    pub can_drop_column: bool,
    /// DDL must be committed before further statements see it.
    pub commit_after_ddl: bool,
    /// Backend folds unquoted identifiers to lowercase.
    pub lowercases_identifiers: bool,
    /// Backend rejects an INSERT with an empty column list; levels without
    /// properties then need a placeholder column.
    pub forbids_empty_insert: bool,

    /// Per-dialect column-keyword override; consulted before the default
    /// mapping.
    pub type_override: Option<fn(&SemanticType) -> Option<&'static str>>,

    pub limit_template: &'static str,
    pub rename_table_template: &'static str,
    pub rename_column_template: &'static str,
    pub drop_index_template: &'static str,
}

impl std::fmt::Debug for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialect").field("name", &self.name).finish()
    }
}

impl Dialect {
    /// SQLite capability set, matching the bundled library.
    pub fn sqlite() -> Self {
        Dialect {
            name: "sqlite",
            max_identifier_len: 64,
            max_row_bytes: 1_000_000_000,
            supports_identity: true,
            supports_exists: true,
            supports_join_update: true,
            can_rename_column: true,
            // ALTER COLUMN TYPE is not supported; retypes take the
            // rename/create/copy/drop fallback.
            can_retype_column: false,
            can_drop_column: true,
            commit_after_ddl: false,
            lowercases_identifiers: false,
            forbids_empty_insert: false,
            type_override: None,
            limit_template: "LIMIT {limit} OFFSET {offset}",
            rename_table_template: "ALTER TABLE {old} RENAME TO {new}",
            rename_column_template: "ALTER TABLE {table} RENAME COLUMN {old} TO {new}",
            drop_index_template: "DROP INDEX {index}",
        }
    }

    /// Conservative ANSI-ish capability set: short identifiers, no identity
    /// columns, no in-place column surgery. Useful as a template for
    /// restricted backends and for exercising the fallback paths.
    pub fn generic() -> Self {
        Dialect {
            name: "generic",
            max_identifier_len: 30,
            max_row_bytes: 65_535,
            supports_identity: false,
            supports_exists: false,
            supports_join_update: false,
            can_rename_column: false,
            can_retype_column: false,
            can_drop_column: false,
            commit_after_ddl: true,
            lowercases_identifiers: false,
            forbids_empty_insert: true,
            type_override: None,
            limit_template: "LIMIT {limit} OFFSET {offset}",
            rename_table_template: "ALTER TABLE {old} RENAME TO {new}",
            rename_column_template: "ALTER TABLE {table} RENAME COLUMN {old} TO {new}",
            drop_index_template: "DROP INDEX {index}",
        }
    }

    /// The backend column keyword for a semantic type.
    pub fn column_type(&self, ty: &SemanticType) -> &'static str {
        if let Some(over) = self.type_override {
            if let Some(keyword) = over(ty) {
                return keyword;
            }
        }
        match ty {
            SemanticType::Bool
            | SemanticType::I8
            | SemanticType::I16
            | SemanticType::I32
            | SemanticType::I64
            | SemanticType::Date
            | SemanticType::Time
            | SemanticType::Timestamp => "INTEGER",
            SemanticType::F32 | SemanticType::F64 => "REAL",
            SemanticType::Text | SemanticType::LongText | SemanticType::Enum(_) => "TEXT",
            SemanticType::Bytes => "BLOB",
            // References and array headers store a row id.
            SemanticType::Ref(_) | SemanticType::Array(_) => "INTEGER",
        }
    }

    pub fn render_limit(&self, limit: u64, offset: u64) -> String {
        self.limit_template
            .replace(TOKEN_LIMIT, &limit.to_string())
            .replace(TOKEN_OFFSET, &offset.to_string())
    }

    pub fn render_rename_table(&self, old: &str, new: &str) -> String {
        self.rename_table_template
            .replace(TOKEN_OLD, old)
            .replace(TOKEN_NEW, new)
    }

    pub fn render_rename_column(&self, table: &str, old: &str, new: &str) -> String {
        self.rename_column_template
            .replace(TOKEN_TABLE, table)
            .replace(TOKEN_OLD, old)
            .replace(TOKEN_NEW, new)
    }

    pub fn render_drop_index(&self, index: &str) -> String {
        self.drop_index_template.replace(TOKEN_INDEX, index)
    }

    /// Derives a valid backend identifier from a class or property name.
    ///
    /// Uppercase, non-alphanumerics replaced with `_`, truncated from the
    /// FRONT (suffixes stay unique across truncation), then checked against
    /// the reserved-word list with `_` appended until clear.
    pub fn identifier(&self, raw: &str) -> String {
        let mut out: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        if out.is_empty() {
            out.push('_');
        }
        if out.len() > self.max_identifier_len {
            out = out.split_off(out.len() - self.max_identifier_len);
        }
        if out.as_bytes()[0].is_ascii_digit() {
            out.replace_range(0..1, "_");
        }
        while RESERVED_WORDS.contains(&out.as_str()) {
            if out.len() >= self.max_identifier_len {
                out.remove(0);
            }
            out.push('_');
        }
        if self.lowercases_identifiers {
            out = out.to_ascii_lowercase();
        }
        out
    }
}

/// Fixed reserved-word list shared by all dialects. Collisions get
/// underscores appended.
const RESERVED_WORDS: &[&str] = &[
    "ALL", "ALTER", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN", "COMMIT",
    "COUNT", "CREATE", "CROSS", "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END",
    "EXISTS", "FOREIGN", "FROM", "FULL", "GROUP", "HAVING", "IN", "INDEX", "INNER", "INSERT",
    "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "NOT", "NULL", "ON", "OR", "ORDER",
    "OUTER", "PRIMARY", "REFERENCES", "RIGHT", "ROLLBACK", "SELECT", "SET", "TABLE", "THEN",
    "UNION", "UNIQUE", "UPDATE", "VALUES", "WHERE",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_uppercases_and_replaces() {
        let d = Dialect::sqlite();
        assert_eq!(d.identifier("color"), "COLOR");
        assert_eq!(d.identifier("shapes.Shape"), "SHAPES_SHAPE");
        assert_eq!(d.identifier("weight-in-kg"), "WEIGHT_IN_KG");
    }

    #[test]
    fn identifier_truncates_from_the_front() {
        let d = Dialect::generic();
        let raw = "com.example.deeply.nested.module.VeryLongClassName";
        let id = d.identifier(raw);
        assert_eq!(id.len(), 30);
        // The suffix survives; the front is what gets cut.
        assert!(id.ends_with("VERYLONGCLASSNAME"));
    }

    #[test]
    fn reserved_words_get_underscores() {
        let d = Dialect::sqlite();
        assert_eq!(d.identifier("order"), "ORDER_");
        assert_eq!(d.identifier("select"), "SELECT_");
        assert_eq!(d.identifier("table"), "TABLE_");
    }

    #[test]
    fn leading_digit_is_replaced() {
        let d = Dialect::sqlite();
        let id = d.identifier("3dShape");
        assert!(!id.as_bytes()[0].is_ascii_digit());
        assert!(id.ends_with("DSHAPE"));
    }

    #[test]
    fn templates_render_with_tokens_substituted() {
        let d = Dialect::sqlite();
        assert_eq!(d.render_limit(10, 20), "LIMIT 10 OFFSET 20");
        assert_eq!(
            d.render_rename_table("OLD_T", "NEW_T"),
            "ALTER TABLE OLD_T RENAME TO NEW_T"
        );
        assert_eq!(
            d.render_rename_column("T", "A", "B"),
            "ALTER TABLE T RENAME COLUMN A TO B"
        );
        assert_eq!(d.render_drop_index("T_A_IX"), "DROP INDEX T_A_IX");
    }

    #[test]
    fn column_type_override_wins() {
        fn big_text(ty: &SemanticType) -> Option<&'static str> {
            match ty {
                SemanticType::LongText => Some("CLOB"),
                _ => None,
            }
        }
        let mut d = Dialect::generic();
        d.type_override = Some(big_text);
        assert_eq!(d.column_type(&SemanticType::LongText), "CLOB");
        assert_eq!(d.column_type(&SemanticType::Text), "TEXT");
    }

    #[test]
    fn reference_and_array_columns_store_row_ids() {
        let d = Dialect::sqlite();
        assert_eq!(d.column_type(&SemanticType::reference("Shape")), "INTEGER");
        assert_eq!(
            d.column_type(&SemanticType::array(SemanticType::I32)),
            "INTEGER"
        );
    }
}
