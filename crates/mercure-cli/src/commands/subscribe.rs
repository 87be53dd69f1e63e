//! Subscribe command - GraphQL subscription over the hub

use anyhow::{bail, Context, Result};
use mercure_gql::{BridgeConfig, GraphQlRequest, SubscriptionBridge};

use crate::output::OutputContext;

/// Register `request` and print every merged result
pub async fn subscribe(
    config: &BridgeConfig,
    request: GraphQlRequest,
    ctx: &OutputContext,
) -> Result<()> {
    let bridge =
        SubscriptionBridge::from_config(config).context("Failed to create subscription bridge")?;

    ctx.info(&format!("Subscribing via {}", config.endpoint));
    ctx.info("Press Ctrl+C to stop");

    let (mut results, teardown) = bridge.subscribe(request);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            next = results.next_result() => match next {
                Some(Ok(result)) => {
                    if ctx.json {
                        ctx.print_json(&result);
                    } else {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    }
                }
                Some(Err(e)) if e.is_terminal() => break Err(e),
                Some(Err(e)) => ctx.error(&e.to_string()),
                None => {
                    ctx.info("Subscription ended");
                    break Ok(());
                }
            },
        }
    };

    teardown.teardown();
    if let Err(e) = outcome {
        bail!("Subscription failed: {}", e);
    }
    ctx.success("Subscription closed");
    Ok(())
}

/// Read a query argument; `@path` reads the document from a file
pub fn read_query(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read query file: {}", path)),
        None => Ok(arg.to_string()),
    }
}

/// Build the request from CLI arguments
pub fn build_request(
    query: &str,
    variables: Option<&str>,
    operation_name: Option<&str>,
) -> Result<GraphQlRequest> {
    let mut request = GraphQlRequest::new(read_query(query)?);
    if let Some(variables) = variables {
        let value: serde_json::Value =
            serde_json::from_str(variables).context("--variables must be a JSON object")?;
        if !value.is_object() {
            bail!("--variables must be a JSON object");
        }
        request = request.with_variables(value);
    }
    if let Some(name) = operation_name {
        request = request.with_operation_name(name);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_build_request() {
        let request = build_request(
            "subscription S { posts { mercureUrl } }",
            Some(r#"{"id": "/posts/1"}"#),
            Some("S"),
        )
        .unwrap();
        assert_eq!(request.variables, Some(json!({"id": "/posts/1"})));
        assert_eq!(request.operation_name.as_deref(), Some("S"));
    }

    #[test]
    fn test_variables_must_be_an_object() {
        assert!(build_request("{ a }", Some("[1]"), None).is_err());
        assert!(build_request("{ a }", Some("not json"), None).is_err());
    }

    #[test]
    fn test_missing_query_file() {
        assert!(read_query("@/nonexistent/query.graphql").is_err());
    }
}
