//! Top-level selection extraction from GraphQL documents
//!
//! Documents are parsed with `graphql-parser`; only the outline is kept:
//! operation kinds and names, and the fields selected directly under each
//! operation. Fragment spreads and inline fragments at the top level are not
//! selections of their own and are skipped.

use graphql_parser::query::{
    self as ast, Definition, OperationDefinition, Selection as AstSelection,
};

use crate::error::{BridgeError, Result};

/// A field selected directly under an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub name: String,
    pub alias: Option<String>,
}

impl Selection {
    /// Key under which the field appears in the response `data`
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// Outline of one operation definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub selections: Vec<Selection>,
}

/// Outline every operation in `document`
pub fn parse_operations(document: &str) -> Result<Vec<Operation>> {
    let parsed = ast::parse_query::<String>(document)
        .map_err(|e| BridgeError::Document(e.to_string()))?;

    Ok(parsed
        .definitions
        .into_iter()
        .filter_map(|definition| match definition {
            Definition::Operation(operation) => Some(outline(operation)),
            Definition::Fragment(_) => None,
        })
        .collect())
}

fn outline(operation: OperationDefinition<'_, String>) -> Operation {
    let (kind, name, selection_set) = match operation {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, set),
        OperationDefinition::Query(q) => (OperationKind::Query, q.name, q.selection_set),
        OperationDefinition::Mutation(m) => (OperationKind::Mutation, m.name, m.selection_set),
        OperationDefinition::Subscription(s) => {
            (OperationKind::Subscription, s.name, s.selection_set)
        }
    };

    let selections = selection_set
        .items
        .into_iter()
        .filter_map(|item| match item {
            AstSelection::Field(field) => Some(Selection {
                name: field.name,
                alias: field.alias,
            }),
            AstSelection::FragmentSpread(_) | AstSelection::InlineFragment(_) => None,
        })
        .collect();

    Operation {
        kind,
        name,
        selections,
    }
}

/// Top-level selections of the operation a request executes.
///
/// With `operation_name` the operation of that name is used; otherwise the
/// first named operation, falling back to the first operation.
pub fn top_level_selections(document: &str, operation_name: Option<&str>) -> Result<Vec<Selection>> {
    let operations = parse_operations(document)?;

    let operation = match operation_name {
        Some(wanted) => operations
            .into_iter()
            .find(|op| op.name.as_deref() == Some(wanted))
            .ok_or_else(|| BridgeError::Document(format!("operation '{}' not found", wanted)))?,
        None => {
            let named = operations.iter().position(|op| op.name.is_some());
            operations
                .into_iter()
                .nth(named.unwrap_or(0))
                .ok_or_else(|| BridgeError::Document("document has no operation".into()))?
        }
    };

    Ok(operation.selections)
}
