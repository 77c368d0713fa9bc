use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::validate::{StatementKind, SuppliedParameters, classify, validate};
use super::{Accessor, BindSource, ParameterSpec, Setter};
use crate::config::EngineOptions;
use crate::conversion::convert_output;
use crate::driver::{CommandType, NativeCommand, NativeParameter, ParameterDirection};
use crate::error::SqlEngineError;
use crate::fingerprint::{Behavior, CallPath, OperationFingerprint};
use crate::provider::{CursorStyle, ProviderProfile};
use crate::translation::{rewrite_markers, scan_script};
use crate::types::{RowValues, ValueType};

/// Name of the synthetic offset marker appended for paged reads.
pub const PAGING_OFFSET: &str = "__offset";
/// Name of the synthetic limit marker appended for paged reads.
pub const PAGING_LIMIT: &str = "__limit";

/// Behavior after applying provider capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBehavior {
    pub command_type: CommandType,
    pub call: CallPath,
    pub kind: StatementKind,
    /// Run the native prepare step before the first execution.
    pub prepare: bool,
    pub paging: bool,
    pub result_cursors: u8,
    /// Fetch declared cursors by name inside an implicit transaction.
    pub cursor_fallback: bool,
    pub strict: bool,
}

struct Binding<S> {
    get: Option<Accessor<S>>,
    set: Option<Setter<S>>,
}

/// Immutable bind routine for one fingerprint.
pub struct CompiledCommand<S> {
    fingerprint: OperationFingerprint,
    profile: Arc<dyn ProviderProfile>,
    specs: Vec<ParameterSpec>,
    bindings: Vec<Binding<S>>,
    behavior: ResolvedBehavior,
    script: Arc<str>,
    bind_order: Vec<usize>,
}

impl<S> fmt::Debug for CompiledCommand<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCommand")
            .field("fingerprint", &self.fingerprint)
            .field("script", &self.script)
            .field("specs", &self.specs)
            .field("behavior", &self.behavior)
            .finish_non_exhaustive()
    }
}

fn synthetic_spec(
    profile: &dyn ProviderProfile,
    name: String,
    value_type: ValueType,
    direction: ParameterDirection,
) -> Result<ParameterSpec, SqlEngineError> {
    let type_code = profile
        .type_code(value_type)
        .ok_or(SqlEngineError::UnsupportedType {
            provider: profile.database_type(),
            value_type,
        })?;
    let mut spec = ParameterSpec::new(name, value_type).with_direction(direction);
    spec.type_code = type_code;
    Ok(spec)
}

/// Compile the bind routine for `fingerprint` from `source`'s shape.
///
/// # Errors
/// Returns `SqlEngineError::ConfigError` when validation fails and
/// `SqlEngineError::UnsupportedType` when a member type has no bind code.
pub fn compile<S: BindSource>(
    fingerprint: &OperationFingerprint,
    profile: Arc<dyn ProviderProfile>,
    source: &S,
    options: &EngineOptions,
) -> Result<CompiledCommand<S>, SqlEngineError> {
    let behavior: Behavior = fingerprint.behavior();
    let caps = profile.capabilities();
    let provider = profile.database_type();
    let members = source.describe();

    let supplied = members.iter().fold(SuppliedParameters::default(), |mut acc, m| {
        if m.decl.direction.is_input() {
            acc.inputs += 1;
        } else {
            acc.outputs += 1;
        }
        acc
    });
    let original_scan = scan_script(fingerprint.script(), caps.marker_prefixes);
    validate(
        profile.as_ref(),
        fingerprint.script(),
        &original_scan,
        behavior,
        supplied,
    )?;
    if behavior.paging && behavior.command_type != CommandType::Text {
        return Err(SqlEngineError::ConfigError(
            "paging is only available for text commands".into(),
        ));
    }

    let mut specs = Vec::with_capacity(members.len() + 2);
    let mut bindings = Vec::with_capacity(members.len() + 2);
    for (idx, member) in members.into_iter().enumerate() {
        let decl = member.decl;
        let type_code = decl
            .db_type
            .or_else(|| profile.type_code(decl.value_type))
            .ok_or(SqlEngineError::UnsupportedType {
                provider,
                value_type: decl.value_type,
            })?;
        let (precision, scale) = if decl.value_type == ValueType::Decimal {
            (
                decl.precision.or(Some(options.decimal_precision)),
                decl.scale.or(Some(options.decimal_scale)),
            )
        } else {
            (decl.precision, decl.scale)
        };
        let size = decl.size.or(match decl.value_type {
            ValueType::Text => options.default_text_size,
            _ => None,
        });
        specs.push(ParameterSpec {
            name: decl.name,
            bind_name: decl.bind_name,
            size,
            precision,
            scale,
            direction: decl.direction,
            value_type: decl.value_type,
            bound_member: Some(idx),
            type_code,
            converter: profile.input_converter(decl.value_type),
            is_paging_marker: false,
            is_cursor_marker: false,
        });
        bindings.push(Binding {
            get: Some(member.get),
            set: if decl.direction.is_output() {
                member.set
            } else {
                None
            },
        });
    }

    let is_procedure = behavior.command_type == CommandType::StoredProcedure;
    if is_procedure
        && behavior.result_cursors > 0
        && caps.cursor_style == CursorStyle::OutputRefCursor
    {
        for n in 1..=behavior.result_cursors {
            let mut spec = synthetic_spec(
                profile.as_ref(),
                format!("__cursor{n}"),
                ValueType::RefCursor,
                ParameterDirection::Output,
            )?;
            spec.is_cursor_marker = true;
            specs.push(spec);
            bindings.push(Binding { get: None, set: None });
        }
    }

    let mut script = if is_procedure {
        profile.procedure_call(fingerprint.script().trim(), &specs)
    } else {
        fingerprint.script().trim_end().trim_end_matches(';').to_string()
    };

    if behavior.paging {
        script.push_str(
            &profile.paging_clause(&profile.marker(PAGING_OFFSET), &profile.marker(PAGING_LIMIT)),
        );
        for name in [PAGING_OFFSET, PAGING_LIMIT] {
            let mut spec = synthetic_spec(
                profile.as_ref(),
                name.to_string(),
                ValueType::I64,
                ParameterDirection::Input,
            )?;
            spec.is_paging_marker = true;
            specs.push(spec);
            bindings.push(Binding { get: None, set: None });
        }
    }

    let scan = scan_script(&script, caps.marker_prefixes);
    let referenced = scan.named();
    let any_named_match = specs.iter().any(|s| {
        referenced
            .iter()
            .any(|r| r.eq_ignore_ascii_case(s.bind_name()))
    });
    if any_named_match {
        let keep: Vec<bool> = specs
            .iter()
            .map(|s| {
                (s.direction == ParameterDirection::ReturnValue && is_procedure)
                    || referenced.iter().any(|r| r.eq_ignore_ascii_case(s.bind_name()))
            })
            .collect();
        let mut flags = keep.iter();
        specs.retain(|_| *flags.next().unwrap_or(&true));
        let mut flags = keep.iter();
        bindings.retain(|_| *flags.next().unwrap_or(&true));
    }

    let names: Vec<&str> = specs.iter().map(ParameterSpec::bind_name).collect();
    let rewritten = rewrite_markers(&script, &scan, caps.native_marker, &names);

    let kind = classify(&rewritten.script);
    let has_inputs = specs.iter().any(|s| s.direction.is_input());
    let resolved = ResolvedBehavior {
        command_type: behavior.command_type,
        call: behavior.call,
        kind,
        prepare: behavior.prepare
            && caps.supports_prepare
            && behavior.command_type == CommandType::Text
            && matches!(kind, StatementKind::Query | StatementKind::Mutation)
            && has_inputs
            && !scan.is_multi_statement(),
        paging: behavior.paging,
        result_cursors: behavior.result_cursors,
        cursor_fallback: is_procedure
            && behavior.result_cursors > 0
            && caps.cursor_style == CursorStyle::RefCursorFetch,
        strict: behavior.strict,
    };

    debug!(
        provider = %provider,
        digest = fingerprint.digest(),
        parameters = specs.len(),
        prepare = resolved.prepare,
        "compiled command"
    );

    Ok(CompiledCommand {
        fingerprint: fingerprint.clone(),
        profile,
        specs,
        bindings,
        behavior: resolved,
        script: Arc::from(rewritten.script),
        bind_order: rewritten.bind_order,
    })
}

/// Parameters agree on everything a native prepare depends on.
fn same_slots(a: &[NativeParameter], b: &[NativeParameter]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.marker == y.marker
                && x.type_code == y.type_code
                && x.direction == y.direction
                && x.size == y.size
                && x.precision == y.precision
                && x.scale == y.scale
        })
}

impl<S> CompiledCommand<S> {
    #[must_use]
    pub fn fingerprint(&self) -> &OperationFingerprint {
        &self.fingerprint
    }

    #[must_use]
    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    /// Script with native markers, paging clause and call text applied.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    #[must_use]
    pub fn behavior(&self) -> ResolvedBehavior {
        self.behavior
    }

    #[must_use]
    pub fn profile(&self) -> &Arc<dyn ProviderProfile> {
        &self.profile
    }

    #[must_use]
    pub fn has_output_loader(&self) -> bool {
        self.bindings.iter().any(|b| b.set.is_some())
    }

    /// Build a bound native command from `source`, reusing `existing` when
    /// given.
    ///
    /// # Errors
    /// Returns the input converter's error when a value cannot be bound.
    pub fn bind(
        &self,
        source: &S,
        existing: Option<NativeCommand>,
        timeout: Option<Duration>,
    ) -> Result<NativeCommand, SqlEngineError> {
        let mut previous = None;
        let mut command = match existing {
            Some(mut command) => {
                previous = Some((
                    Arc::clone(&command.script),
                    std::mem::take(&mut command.parameters),
                ));
                command.script = Arc::clone(&self.script);
                command.command_type = self.behavior.command_type;
                command
            }
            None => self
                .profile
                .new_command(Arc::clone(&self.script), self.behavior.command_type),
        };
        command.timeout = timeout;
        command.bind_order.clone_from(&self.bind_order);

        for (position, (spec, binding)) in self.specs.iter().zip(&self.bindings).enumerate() {
            let raw = match (&binding.get, spec.direction) {
                (_, ParameterDirection::Output | ParameterDirection::ReturnValue) | (None, _) => {
                    RowValues::Null
                }
                (Some(get), _) => get(source),
            };
            let value = match spec.converter {
                Some(convert) if !raw.is_null() => convert(&raw)?,
                _ => raw,
            };
            command
                .parameters
                .push(self.profile.new_parameter(spec, value, position + 1));
        }
        if let Some((script, parameters)) = previous
            && (script != command.script || !same_slots(&parameters, &command.parameters))
        {
            command.prepared = false;
        }
        Ok(command)
    }

    /// Rewrite the two synthetic paging values on an already bound command.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ConfigError` if the command was not compiled
    /// for paging.
    pub fn set_paging(
        &self,
        command: &mut NativeCommand,
        offset: u64,
        limit: u64,
    ) -> Result<(), SqlEngineError> {
        if !self.behavior.paging {
            return Err(SqlEngineError::ConfigError(
                "command was not compiled for paging".into(),
            ));
        }
        for (name, value) in [(PAGING_OFFSET, offset), (PAGING_LIMIT, limit)] {
            let param = command.parameter_mut(name).ok_or_else(|| {
                SqlEngineError::ParameterError(format!("paging marker {name} is not bound"))
            })?;
            param.value = RowValues::Int(i64::try_from(value).map_err(|_| {
                SqlEngineError::ParameterError(format!("{name} value {value} is out of range"))
            })?);
        }
        Ok(())
    }

    /// Copy output parameter values from an executed command onto `source`.
    ///
    /// # Errors
    /// Returns `SqlEngineError::ConversionError` when a strict conversion fails.
    pub fn load_output(&self, source: &mut S, command: &NativeCommand) -> Result<(), SqlEngineError> {
        let provider = self.profile.database_type();
        for (spec, binding) in self.specs.iter().zip(&self.bindings) {
            let Some(set) = &binding.set else {
                continue;
            };
            let raw = command
                .parameter(&spec.name)
                .map_or(RowValues::Null, |p| p.value.clone());
            let value = convert_output(provider, raw, spec.value_type, self.behavior.strict)?;
            set(source, value)?;
        }
        Ok(())
    }

    /// Names of output cursor parameters, in declaration order.
    #[must_use]
    pub fn cursor_parameters(&self) -> Vec<&str> {
        self.specs
            .iter()
            .filter(|s| s.is_cursor_marker)
            .map(|s| s.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BindSource, ParamDecl, ParamList};
    use crate::provider::{MssqlProfile, MysqlProfile, OracleProfile, PostgresProfile, SqliteProfile};
    use crate::types::DatabaseType;
    use rust_decimal::Decimal;

    fn compile_list(
        profile: Arc<dyn ProviderProfile>,
        script: &str,
        params: &ParamList,
        behavior: Behavior,
    ) -> Result<CompiledCommand<ParamList>, SqlEngineError> {
        let fp = OperationFingerprint::new(
            profile.database_type(),
            script,
            params.shape_id(),
            behavior,
        );
        compile(&fp, profile, params, &EngineOptions::default())
    }

    #[test]
    fn postgres_markers_become_numbered() {
        let params = ParamList::new().add("id", 7_i64).add("name", "x".to_string());
        let compiled = compile_list(
            Arc::new(PostgresProfile::new()),
            "update t set name = @name where id = @id",
            &params,
            Behavior::non_query(),
        )
        .unwrap();
        assert_eq!(compiled.script(), "update t set name = $2 where id = $1");
        let cmd = compiled.bind(&params, None, None).unwrap();
        assert_eq!(cmd.parameters[0].marker, "$1");
        assert_eq!(cmd.parameters[0].value, RowValues::Int(7));
        assert_eq!(cmd.parameters[1].type_code, 25);
    }

    #[test]
    fn mysql_anonymous_markers_record_bind_order() {
        let params = ParamList::new().add("id", 7_i64);
        let compiled = compile_list(
            Arc::new(MysqlProfile::new()),
            "SELECT id, name FROM t WHERE id = @id OR parent = @id",
            &params,
            Behavior::reader(),
        )
        .unwrap();
        assert_eq!(compiled.script(), "SELECT id, name FROM t WHERE id = ? OR parent = ?");
        let cmd = compiled.bind(&params, None, None).unwrap();
        assert_eq!(cmd.positional_values(), vec![&RowValues::Int(7), &RowValues::Int(7)]);
    }

    #[test]
    fn unreferenced_members_are_not_bound() {
        let params = ParamList::new().add("id", 1_i64).add("unused", 2_i64);
        let compiled = compile_list(
            Arc::new(SqliteProfile::new()),
            "select * from t where id = @id",
            &params,
            Behavior::reader(),
        )
        .unwrap();
        assert_eq!(compiled.specs().len(), 1);
        assert_eq!(compiled.script(), "select * from t where id = ?1");
    }

    #[test]
    fn decimal_defaults_apply_unless_declared() {
        let params = ParamList::new()
            .add("amount", Decimal::new(1050, 2))
            .add_declared(
                ParamDecl::new("rate", ValueType::Decimal).precision(9).scale(4),
                RowValues::Decimal(Decimal::new(5, 2)),
            );
        let compiled = compile_list(
            Arc::new(MssqlProfile::new()),
            "insert into t (amount, rate) values (@amount, @rate)",
            &params,
            Behavior::non_query(),
        )
        .unwrap();
        assert_eq!(
            (compiled.specs()[0].precision, compiled.specs()[0].scale),
            (Some(18), Some(2))
        );
        assert_eq!(
            (compiled.specs()[1].precision, compiled.specs()[1].scale),
            (Some(9), Some(4))
        );
    }

    #[test]
    fn paging_appends_markers_and_rewrites_values() {
        let compiled = compile_list(
            Arc::new(SqliteProfile::new()),
            "select id from t order by id;",
            &ParamList::new(),
            Behavior::reader().with_paging(true),
        )
        .unwrap();
        assert_eq!(
            compiled.script(),
            "select id from t order by id LIMIT ?2 OFFSET ?1"
        );
        let mut cmd = compiled.bind(&ParamList::new(), None, None).unwrap();
        compiled.set_paging(&mut cmd, 20, 10).unwrap();
        assert_eq!(cmd.parameter(PAGING_OFFSET).unwrap().value, RowValues::Int(20));
        assert_eq!(cmd.parameter(PAGING_LIMIT).unwrap().value, RowValues::Int(10));
    }

    #[test]
    fn oracle_procedures_get_cursor_markers() {
        let params = ParamList::new().add("id", 1_i32);
        let compiled = compile_list(
            Arc::new(OracleProfile::new()),
            "pkg.load_all",
            &params,
            Behavior::reader()
                .with_command_type(CommandType::StoredProcedure)
                .with_result_cursors(2),
        )
        .unwrap();
        assert_eq!(
            compiled.script(),
            "BEGIN pkg.load_all(:id, :__cursor1, :__cursor2); END;"
        );
        assert_eq!(compiled.cursor_parameters(), vec!["__cursor1", "__cursor2"]);
        assert!(!compiled.behavior().cursor_fallback);
    }

    #[test]
    fn postgres_procedures_with_cursors_use_fallback() {
        let compiled = compile_list(
            Arc::new(PostgresProfile::new()),
            "load_all",
            &ParamList::new(),
            Behavior::reader()
                .with_command_type(CommandType::StoredProcedure)
                .with_result_cursors(2),
        )
        .unwrap();
        assert_eq!(compiled.script(), "SELECT * FROM load_all()");
        assert!(compiled.behavior().cursor_fallback);
    }

    #[test]
    fn output_values_load_back_onto_the_source() {
        let mut params = ParamList::new()
            .add("id", 3_i32)
            .add_output("total", ValueType::I64);
        let compiled = compile_list(
            Arc::new(MssqlProfile::new()),
            "select @total = count(*) from t where id = @id",
            &params,
            Behavior::non_query(),
        )
        .unwrap();
        assert!(compiled.has_output_loader());
        let mut cmd = compiled.bind(&params, None, None).unwrap();
        assert_eq!(cmd.parameter("total").unwrap().value, RowValues::Null);
        cmd.parameter_mut("total").unwrap().value = RowValues::Decimal(Decimal::from(12));
        compiled.load_output(&mut params, &cmd).unwrap();
        assert_eq!(params.get::<i64>("total").unwrap(), 12);
    }

    #[test]
    fn unsupported_member_types_fail_compilation() {
        let params = ParamList::new().add("at", chrono::NaiveTime::MIN);
        let err = compile_list(
            Arc::new(OracleProfile::new()),
            "select * from t where at = :at",
            &params,
            Behavior::reader(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SqlEngineError::UnsupportedType {
                provider: DatabaseType::Oracle,
                value_type: ValueType::Time
            }
        ));
    }

    #[test]
    fn prepare_is_skipped_for_procedures_and_unparameterized_scripts() {
        let params = ParamList::new().add("id", 1_i64);
        let prepared = compile_list(
            Arc::new(PostgresProfile::new()),
            "select * from t where id = @id",
            &params,
            Behavior::reader().with_prepare(true),
        )
        .unwrap();
        assert!(prepared.behavior().prepare);
        let procedure = compile_list(
            Arc::new(PostgresProfile::new()),
            "get_t",
            &params,
            Behavior::reader()
                .with_prepare(true)
                .with_command_type(CommandType::StoredProcedure),
        )
        .unwrap();
        assert!(!procedure.behavior().prepare);
    }

    #[test]
    fn rebinding_keeps_the_prepared_flag_only_for_the_same_slots() {
        let profile: Arc<dyn ProviderProfile> = Arc::new(PostgresProfile::new());
        let script = "select * from t where id = @id";
        let ints = ParamList::new().add("id", 1_i64);
        let compiled = compile_list(Arc::clone(&profile), script, &ints, Behavior::reader()).unwrap();
        let mut cmd = compiled.bind(&ints, None, None).unwrap();
        cmd.prepared = true;

        let cmd = compiled.bind(&ParamList::new().add("id", 2_i64), Some(cmd), None).unwrap();
        assert!(cmd.prepared);

        let texts = ParamList::new().add("id", "x".to_string());
        let other = compile_list(profile, script, &texts, Behavior::reader()).unwrap();
        let cmd = other.bind(&texts, Some(cmd), None).unwrap();
        assert!(!cmd.prepared);
    }
}
