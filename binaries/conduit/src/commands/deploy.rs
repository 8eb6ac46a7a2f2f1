//! Deploy a script and watch its responses come back.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use conduit_structs::{DeploymentResponse, DeploymentStats};

use crate::config::Config;

pub struct DeployOptions {
    pub script: PathBuf,
    pub mailboxes: Vec<String>,
    pub pattern: String,
    pub name: String,
    pub attach: Option<PathBuf>,
    pub no_results: bool,
    /// How long to keep polling for responses, in seconds.
    pub timeout: u64,
    pub expand: bool,
}

pub async fn deploy(config: &Config, opts: DeployOptions) -> anyhow::Result<()> {
    if opts.mailboxes.is_empty() && opts.pattern.is_empty() {
        anyhow::bail!("provide a list of mailboxes, a pattern, or both");
    }
    let client = config.admin_client()?;
    let body = tokio::fs::read_to_string(&opts.script)
        .await
        .with_context(|| format!("read {}", opts.script.display()))?;

    let asset = match &opts.attach {
        Some(path) => client.upload_asset(path).await?,
        None => String::new(),
    };

    let resp = client
        .put_message(&opts.mailboxes, &opts.pattern, &body, &opts.name, &asset)
        .await?;
    println!(
        "Script deployed to {} mailboxes ({} bytes)",
        resp.mailboxes.len(),
        body.len()
    );
    println!("Deployment: {}", resp.deployment_id);

    if opts.no_results {
        return Ok(());
    }
    let started = Instant::now();
    let deadline = Duration::from_secs(opts.timeout);
    let stats = client
        .poll_deployment(&resp.deployment_id, |stats| {
            stats.pending_count > 0 && started.elapsed() < deadline
        })
        .await?;
    print_stats(&stats, opts.expand);
    Ok(())
}

pub async fn get(config: &Config, deployment: &str, expand: bool) -> anyhow::Result<()> {
    let client = config.admin_client()?;
    let stats = client.deployment_stats(deployment).await?;
    print_stats(&stats, expand);
    Ok(())
}

pub async fn list(config: &Config, count: i64, name: &str, all: bool) -> anyhow::Result<()> {
    let client = config.admin_client()?;
    let key_search = if all { "" } else { config.admin.name.as_str() };
    let resp = client.list_deployments(name, key_search, count, false).await?;
    if resp.deployments.is_empty() {
        println!("There are no deployments.");
        return Ok(());
    }
    for dep in resp.deployments {
        println!("{}:", dep.name);
        println!("   Deployed at: {}", dep.created_at);
        println!("   Deployed by: {}", dep.deployed_by);
        println!(
            "   Executions: {}/{}",
            dep.message_count - dep.pending_count,
            dep.message_count
        );
        println!("   Responses: {}/{}", dep.response_count, dep.message_count);
    }
    Ok(())
}

fn print_stats(stats: &DeploymentStats, expand: bool) {
    println!();
    println!("{}", stats.name);
    println!("Total messages: {}", stats.message_count);
    println!("Pending messages: {}", stats.pending_count);
    println!("Total responses: {}", stats.response_count);
    if stats.responses.is_empty() {
        return;
    }
    println!();
    println!("Responses:");
    if expand {
        for r in &stats.responses {
            print_response(&r.mailbox, r);
        }
    } else {
        for (label, r) in consolidate(&stats.responses, stats.responses.len()) {
            print_response(&label, r);
        }
    }
}

fn print_response(label: &str, r: &DeploymentResponse) {
    if r.is_error {
        println!("{label}: ERROR {}", r.response);
    } else {
        println!("{label}: {}", r.response);
    }
}

/// Collapse identical response texts into one line each, labelled with the
/// single mailbox or a `seen/total` count.
fn consolidate<'a>(
    responses: &'a [DeploymentResponse],
    total: usize,
) -> Vec<(String, &'a DeploymentResponse)> {
    let mut groups: Vec<(Vec<&str>, &DeploymentResponse)> = Vec::new();
    for r in responses {
        match groups
            .iter_mut()
            .find(|(_, first)| first.response == r.response && first.is_error == r.is_error)
        {
            Some((mailboxes, _)) => mailboxes.push(&r.mailbox),
            None => groups.push((vec![&r.mailbox], r)),
        }
    }
    groups
        .into_iter()
        .map(|(mailboxes, first)| {
            let label = if mailboxes.len() == 1 {
                mailboxes[0].to_string()
            } else {
                format!("{}/{}", mailboxes.len(), total)
            };
            (label, first)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::consolidate;
    use conduit_structs::DeploymentResponse;

    fn response(mailbox: &str, text: &str, is_error: bool) -> DeploymentResponse {
        DeploymentResponse {
            mailbox: mailbox.to_string(),
            response: text.to_string(),
            is_error,
            ..Default::default()
        }
    }

    #[test]
    fn identical_responses_collapse() {
        let responses = vec![
            response("m1", "ok", false),
            response("m2", "ok", false),
            response("m3", "broken", true),
        ];
        let grouped = consolidate(&responses, responses.len());
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "2/3");
        assert_eq!(grouped[1].0, "m3");
        assert!(grouped[1].1.is_error);
    }

    #[test]
    fn same_text_different_outcome_stays_split() {
        let responses = vec![
            response("m1", "done", false),
            response("m2", "done", true),
        ];
        let grouped = consolidate(&responses, responses.len());
        assert_eq!(grouped.len(), 2);
    }
}
