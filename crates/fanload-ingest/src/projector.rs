//! Field-to-column projection
//!
//! The projector is built once per reader from the resolved field list and the
//! job's column declarations. Projecting a row has no state beyond the plan, so
//! one projector may be shared by any number of tasks.

use std::collections::HashMap;
use std::sync::Arc;

use fanload_common::{FanloadError, Result};

use crate::job::{ColumnSpec, QualifiedName};
use crate::transform::Transform;
use crate::Row;

pub type RowTransformFn = Arc<dyn Fn(&Row) -> Row + Send + Sync>;

#[derive(Debug, Clone)]
struct ColumnPlan {
    name: String,
    /// Position in the raw row; `None` for computed columns
    position: Option<usize>,
    transform: Option<Transform>,
}

#[derive(Debug, Clone)]
pub struct FieldProjector {
    plan: Vec<ColumnPlan>,
}

impl FieldProjector {
    /// Build the projection of `fields` onto `columns` for `target`.
    ///
    /// With no declared columns every field loads into a same-named column.
    pub fn preprocess(
        fields: &[String],
        columns: &[ColumnSpec],
        target: &QualifiedName,
    ) -> Result<Self> {
        let mut positions = HashMap::with_capacity(fields.len());
        for (position, field) in fields.iter().enumerate() {
            positions.entry(field.as_str()).or_insert(position);
        }

        if columns.is_empty() {
            let plan = fields
                .iter()
                .enumerate()
                .map(|(position, field)| ColumnPlan {
                    name: field.clone(),
                    position: Some(position),
                    transform: None,
                })
                .collect();
            return Ok(Self { plan });
        }

        let mut plan = Vec::with_capacity(columns.len());
        for column in columns {
            let position = match &column.field {
                Some(field) => Some(*positions.get(field.as_str()).ok_or_else(|| {
                    FanloadError::Projection(format!(
                        "column {}.{} maps field '{}' which is not among the source fields [{}]",
                        target,
                        column.name,
                        field,
                        fields.join(", ")
                    ))
                })?),
                None => positions.get(column.name.as_str()).copied(),
            };

            if position.is_none() && column.transform.is_none() {
                return Err(FanloadError::Projection(format!(
                    "column {}.{} has no source field and no transform",
                    target, column.name
                )));
            }

            plan.push(ColumnPlan {
                name: column.name.clone(),
                position,
                transform: column.transform.clone(),
            });
        }

        Ok(Self { plan })
    }

    /// Reorder and transform one raw row into column order
    pub fn project(&self, row: &Row) -> Row {
        self.plan
            .iter()
            .map(|column| {
                let raw = column
                    .position
                    .and_then(|position| row.get(position))
                    .and_then(|value| value.as_deref());
                match &column.transform {
                    Some(transform) => transform.apply(raw),
                    None => raw.map(str::to_string),
                }
            })
            .collect()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.plan.iter().map(|c| c.name.as_str())
    }

    /// Quoted column list for the bulk-write statement
    pub fn copy_columns(&self) -> Vec<String> {
        copy_column_list(self.column_names())
    }

    pub fn into_row_fn(self) -> RowTransformFn {
        Arc::new(move |row: &Row| self.project(row))
    }
}

/// Double-quote every column identifier, keeping declaration order
pub fn copy_column_list<I, S>(columns: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    columns
        .into_iter()
        .map(|name| quote_identifier(name.as_ref()))
        .collect()
}

/// Quote an identifier; embedded quotes are doubled
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transform::TransformRegistry;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(values: &[Option<&str>]) -> Row {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    fn table() -> QualifiedName {
        QualifiedName::new(Some("public"), "orders")
    }

    #[test]
    fn test_reorders_drops_and_transforms() {
        let transforms = TransformRegistry::with_builtins();
        let columns = vec![
            ColumnSpec::new("customer").from_field("name").with_transform(transforms.get("upper").unwrap()),
            ColumnSpec::new("id"),
        ];
        let projector =
            FieldProjector::preprocess(&fields(&["id", "name", "unused"]), &columns, &table()).unwrap();

        let projected = projector.project(&row(&[Some("7"), Some("acme"), Some("zzz")]));
        assert_eq!(projected, row(&[Some("ACME"), Some("7")]));
    }

    #[test]
    fn test_computed_column_receives_no_input() {
        let constant = Transform::new("constant", |v| match v {
            None => Some("import".to_string()),
            Some(s) => Some(s.to_string()),
        });
        let columns = vec![ColumnSpec::new("id"), ColumnSpec::new("origin").with_transform(constant)];
        let projector = FieldProjector::preprocess(&fields(&["id"]), &columns, &table()).unwrap();
        assert_eq!(
            projector.project(&row(&[Some("1")])),
            row(&[Some("1"), Some("import")])
        );
    }

    #[test]
    fn test_short_rows_yield_nulls() {
        let projector =
            FieldProjector::preprocess(&fields(&["a", "b", "c"]), &[], &table()).unwrap();
        assert_eq!(projector.project(&row(&[Some("1")])), row(&[Some("1"), None, None]));
    }

    #[test]
    fn test_unmapped_column_is_projection_error() {
        let err = FieldProjector::preprocess(&fields(&["id"]), &[ColumnSpec::new("missing")], &table())
            .unwrap_err();
        assert!(matches!(err, FanloadError::Projection(_)));
        assert!(err.to_string().contains("public.orders.missing"));

        let err = FieldProjector::preprocess(
            &fields(&["id"]),
            &[ColumnSpec::new("id").from_field("nope")],
            &table(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'nope'"));
    }

    #[test]
    fn test_copy_column_list_quotes_in_declared_order() {
        let list = copy_column_list(["select", "MixedCase", "plain", "has\"quote"]);
        assert_eq!(list, vec![r#""select""#, r#""MixedCase""#, r#""plain""#, r#""has""quote""#]);
    }

    #[test]
    fn test_copy_columns_follow_declarations() {
        let columns = vec![ColumnSpec::new("Zeta"), ColumnSpec::new("alpha")];
        let projector =
            FieldProjector::preprocess(&fields(&["alpha", "Zeta"]), &columns, &table()).unwrap();
        assert_eq!(projector.copy_columns(), vec![r#""Zeta""#, r#""alpha""#]);
    }

    #[test]
    fn test_row_fn_is_shareable_across_threads() {
        let projector =
            FieldProjector::preprocess(&fields(&["a"]), &[], &table()).unwrap();
        let row_fn = projector.into_row_fn();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let row_fn = Arc::clone(&row_fn);
                std::thread::spawn(move || row_fn(&vec![Some(i.to_string())]))
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), vec![Some(i.to_string())]);
        }
    }
}
