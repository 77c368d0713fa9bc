use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use crate::driver::CommandType;
use crate::error::SqlEngineError;
use crate::fingerprint::{Behavior, CallPath};
use crate::provider::ProviderProfile;
use crate::translation::{MarkerKind, ScriptScan};

lazy_static! {
    static ref LEADING_NOISE: Regex =
        Regex::new(r"^(?:\s+|--[^\n]*(?:\n|$)|/\*(?s:.*?)\*/|\()*").expect("valid regex");
    static ref LEADING_KEYWORD: Regex = Regex::new(r"^([A-Za-z]+)").expect("valid regex");
    static ref DECLARED_VARIABLE: Regex =
        Regex::new(r"(?i)\bdeclare\s+@([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex");
}

/// Kind of statement a script starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Mutation,
    Definition,
    Permission,
    ProcedureCall,
    AnonymousBlock,
    Other,
}

/// Classify a script by its leading keyword.
#[must_use]
pub fn classify(script: &str) -> StatementKind {
    let rest = LEADING_NOISE
        .find(script)
        .map_or(script, |m| &script[m.end()..]);
    let Some(keyword) = LEADING_KEYWORD.captures(rest).and_then(|c| c.get(1)) else {
        return StatementKind::Other;
    };
    match keyword.as_str().to_ascii_uppercase().as_str() {
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "EXPLAIN" | "PRAGMA" | "FETCH" => {
            StatementKind::Query
        }
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "REPLACE" | "UPSERT" => StatementKind::Mutation,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT" => StatementKind::Definition,
        "GRANT" | "REVOKE" | "DENY" => StatementKind::Permission,
        "EXEC" | "EXECUTE" | "CALL" => StatementKind::ProcedureCall,
        "BEGIN" | "DECLARE" | "DO" => StatementKind::AnonymousBlock,
        _ => StatementKind::Other,
    }
}

/// Bind markers in `scan` that the script itself does not declare.
fn expected_markers(script: &str, scan: &ScriptScan) -> usize {
    let declared: HashSet<String> = DECLARED_VARIABLE
        .captures_iter(script)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect();
    scan.markers
        .iter()
        .filter(|m| match &m.kind {
            MarkerKind::Named(name) => !declared.contains(&name.to_ascii_lowercase()),
            MarkerKind::Positional => true,
        })
        .count()
}

/// What the caller supplied, as far as validation is concerned.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuppliedParameters {
    pub inputs: usize,
    pub outputs: usize,
}

impl SuppliedParameters {
    #[must_use]
    pub fn total(self) -> usize {
        self.inputs + self.outputs
    }
}

/// Reject operations that can never run correctly. Runs before compilation
/// and its result is never cached.
///
/// # Errors
/// Returns `SqlEngineError::ConfigError` describing the first violated rule.
pub fn validate(
    profile: &dyn ProviderProfile,
    script: &str,
    scan: &ScriptScan,
    behavior: Behavior,
    supplied: SuppliedParameters,
) -> Result<(), SqlEngineError> {
    let caps = profile.capabilities();
    let provider = profile.database_type();

    if script.trim().is_empty() {
        return Err(SqlEngineError::ConfigError("script is empty".into()));
    }

    if behavior.command_type == CommandType::StoredProcedure && !caps.supports_stored_procedures {
        return Err(SqlEngineError::ConfigError(format!(
            "{provider} does not support stored procedures"
        )));
    }

    if supplied.outputs > 0 && !caps.supports_output_params {
        return Err(SqlEngineError::ConfigError(format!(
            "{provider} does not support output parameters"
        )));
    }

    if behavior.result_cursors > 0 && behavior.command_type != CommandType::StoredProcedure {
        return Err(SqlEngineError::ConfigError(
            "result cursors can only be declared for stored procedures".into(),
        ));
    }

    let kind = classify(script);

    if matches!(behavior.call, CallPath::Reader | CallPath::Scalar)
        && matches!(kind, StatementKind::Definition | StatementKind::Permission)
        && behavior.command_type == CommandType::Text
    {
        return Err(SqlEngineError::ConfigError(format!(
            "{kind:?} statements do not return results; use a non-query call"
        )));
    }

    let is_block = behavior.command_type == CommandType::AnonymousBlock
        || (behavior.command_type == CommandType::Text
            && kind == StatementKind::AnonymousBlock
            && scan.is_multi_statement());
    if is_block && supplied.total() > 0 && !caps.params_in_anonymous_block {
        return Err(SqlEngineError::ConfigError(format!(
            "{provider} does not accept bind parameters on anonymous blocks"
        )));
    }

    if behavior.command_type == CommandType::Text {
        let expected = expected_markers(script, scan);
        if kind == StatementKind::Mutation && expected == 0 && supplied.inputs > 0 {
            return Err(SqlEngineError::ConfigError(
                "parameters supplied to a statement without bind markers".into(),
            ));
        }
        if expected > 0 && supplied.total() == 0 && !behavior.paging {
            return Err(SqlEngineError::ConfigError(format!(
                "script expects {expected} bind marker(s) but no parameters were supplied"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MssqlProfile, PostgresProfile, SqliteProfile};
    use crate::translation::scan_script;

    fn check(
        profile: &dyn ProviderProfile,
        script: &str,
        behavior: Behavior,
        inputs: usize,
    ) -> Result<(), SqlEngineError> {
        let scan = scan_script(script, profile.capabilities().marker_prefixes);
        validate(
            profile,
            script,
            &scan,
            behavior,
            SuppliedParameters { inputs, outputs: 0 },
        )
    }

    #[test]
    fn classifies_leading_keyword_past_comments() {
        assert_eq!(classify("  -- note\n/* x */ select 1"), StatementKind::Query);
        assert_eq!(classify("(SELECT 1) UNION (SELECT 2)"), StatementKind::Query);
        assert_eq!(classify("update t set a = 1"), StatementKind::Mutation);
        assert_eq!(classify("CREATE TABLE t (a int)"), StatementKind::Definition);
        assert_eq!(classify("grant select on t to bob"), StatementKind::Permission);
        assert_eq!(classify("BEGIN x := 1; END;"), StatementKind::AnonymousBlock);
        assert_eq!(classify("vacuum"), StatementKind::Other);
    }

    #[test]
    fn parameters_against_unparameterized_mutation_are_rejected() {
        let profile = SqliteProfile::new();
        let err = check(&profile, "delete from t", Behavior::non_query(), 1).unwrap_err();
        assert!(matches!(err, SqlEngineError::ConfigError(_)));
        assert!(check(&profile, "delete from t where id = @id", Behavior::non_query(), 1).is_ok());
    }

    #[test]
    fn markers_without_parameters_are_rejected_unless_paging() {
        let profile = PostgresProfile::new();
        let script = "select * from t where id = @id";
        assert!(check(&profile, script, Behavior::reader(), 0).is_err());
        assert!(check(&profile, "select * from t", Behavior::reader().with_paging(true), 0).is_ok());
    }

    #[test]
    fn declared_variables_are_not_bind_markers() {
        let profile = MssqlProfile::new();
        let script = "declare @n int; set @n = 1; select @n";
        assert!(check(&profile, script, Behavior::reader(), 0).is_ok());
    }

    #[test]
    fn definitions_cannot_use_result_paths() {
        let profile = SqliteProfile::new();
        assert!(check(&profile, "create table t (a int)", Behavior::reader(), 0).is_err());
        assert!(check(&profile, "create table t (a int)", Behavior::scalar(), 0).is_err());
        assert!(check(&profile, "create table t (a int)", Behavior::non_query(), 0).is_ok());
    }

    #[test]
    fn anonymous_blocks_reject_parameters_where_forbidden() {
        let block = Behavior::non_query().with_command_type(CommandType::AnonymousBlock);
        let script = "DO $$ BEGIN PERFORM 1; END $$";
        assert!(check(&PostgresProfile::new(), script, block, 1).is_err());
        assert!(check(&MssqlProfile::new(), "BEGIN SELECT @a; END", block, 1).is_ok());
    }

    #[test]
    fn stored_procedures_need_provider_support() {
        let call = Behavior::non_query().with_command_type(CommandType::StoredProcedure);
        assert!(check(&SqliteProfile::new(), "do_work", call, 0).is_err());
        assert!(check(&MssqlProfile::new(), "dbo.do_work", call, 0).is_ok());
    }
}
