use crate::lifecycle::{CommandResult, Value};
use crate::terminal::TerminalClient;
use anyhow::Result;
use serde_json::json;

/// Drive an attached service from the command line.
///
/// With arguments, the first is the command kind and the rest are passed as
/// text; the outcome is printed as JSON. Without arguments, print state
/// changes until the service closes the connection.
pub(crate) async fn cmd_attach(mut client: TerminalClient, args: &[String]) -> Result<i32> {
    let Some((kind, rest)) = args.split_first() else {
        return cmd_attach_follow(client).await;
    };

    let args = rest.iter().map(|arg| Value::from(arg.as_str())).collect();
    let outcome = client.command(kind, args).await?;
    println!(
        "{}",
        json!({
            "service": client.service(),
            "command": kind,
            "result": outcome.result.to_string(),
            "state": outcome.state.as_str(),
            "value": outcome.value,
        })
    );

    Ok(if outcome.result == CommandResult::Completed {
        0
    } else {
        1
    })
}

async fn cmd_attach_follow(mut client: TerminalClient) -> Result<i32> {
    if client.mode().can_subscribe() {
        let state = client.subscribe().await?;
        println!(
            "{}",
            json!({ "service": client.service(), "state": state.as_str() })
        );
    } else {
        anyhow::bail!(
            "Terminal mode {:?} does not deliver state events; pass a command instead",
            client.mode()
        );
    }

    while let Some(change) = client.next_event().await? {
        println!(
            "{}",
            json!({ "from": change.from.as_str(), "to": change.to.as_str() })
        );
    }
    Ok(0)
}
