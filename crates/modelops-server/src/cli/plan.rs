use super::{
    ApproveArgs, CancelArgs, HistoryArgs, PlanCommands, PlanCreateArgs, PlanListArgs, PlanShowArgs, RejectArgs,
    StatusArgs,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use modelops_client::{ModelOpsClient, PlanRequest};
use modelops_core::{DeploymentExecution, DeploymentStrategy, PlanView, ScheduleOutcome};

pub async fn run(cmd: PlanCommands, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    match cmd {
        PlanCommands::Create(args) => create(args, &client).await,
        PlanCommands::List(args) => list(args, &client).await,
        PlanCommands::Show(args) => show(args, &client).await,
    }
}

/// `immediate`, `rolling`, `blue-green` or `canary:<percent>`.
pub fn parse_strategy(s: &str) -> Result<DeploymentStrategy> {
    let lowered = s.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "immediate" => Ok(DeploymentStrategy::Immediate),
        "rolling" => Ok(DeploymentStrategy::Rolling),
        "blue-green" | "blue_green" | "bluegreen" => Ok(DeploymentStrategy::BlueGreen),
        other => match other.strip_prefix("canary:") {
            Some(pct) => {
                let percentage: u8 = pct
                    .parse()
                    .with_context(|| format!("canary percentage '{}' is not a number", pct))?;
                if percentage == 0 || percentage > 100 {
                    bail!("canary percentage must be within 1..=100, got {}", percentage);
                }
                Ok(DeploymentStrategy::Canary { percentage })
            }
            None => bail!("unknown strategy '{}' (immediate, rolling, blue-green, canary:<percent>)", s),
        },
    }
}

fn describe_outcome(outcome: &ScheduleOutcome) -> String {
    match outcome {
        ScheduleOutcome::AwaitingApproval => "awaiting approval".to_string(),
        ScheduleOutcome::Scheduled { at } => format!("scheduled for {}", at.to_rfc3339()),
        ScheduleOutcome::Started { execution_id } => format!("started execution {}", execution_id),
    }
}

async fn create(args: PlanCreateArgs, client: &ModelOpsClient) -> Result<()> {
    let mut request = PlanRequest::new(&args.model, args.version, args.env)
        .strategy(parse_strategy(&args.strategy)?)
        .reason(args.reason);
    if let Some(at) = &args.at {
        let when: DateTime<Utc> = DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("--at '{}' is not an RFC 3339 timestamp", at))?
            .with_timezone(&Utc);
        request = request.at(when);
    }

    let created = client.create_plan(&request).await?;
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({
            "plan": created.plan,
            "outcome": created.outcome,
        }))?);
        return Ok(());
    }

    println!("Plan {} created: {}", created.plan.id, describe_outcome(&created.outcome));
    if created.outcome == ScheduleOutcome::AwaitingApproval {
        println!("  approve with: modelops approve {}", created.plan.id);
    }
    Ok(())
}

fn print_plan_row(view: &PlanView) {
    println!(
        "{:<36}  {:<20}  {:<9}  {:<11}  {:<12}  {}",
        view.plan.id,
        view.plan.model_id,
        view.plan.version.to_string(),
        view.plan.environment.to_string(),
        view.plan.strategy.to_string(),
        view.state,
    );
}

async fn list(args: PlanListArgs, client: &ModelOpsClient) -> Result<()> {
    let plans = client.list_plans().await?;
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }
    if plans.is_empty() {
        println!("(no deployment plans)");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<9}  {:<11}  {:<12}  {}",
        "ID", "MODEL", "VERSION", "ENV", "STRATEGY", "STATE"
    );
    println!("{}", "─".repeat(110));
    for view in &plans {
        print_plan_row(view);
    }
    Ok(())
}

async fn show(args: PlanShowArgs, client: &ModelOpsClient) -> Result<()> {
    let view = client.get_plan(args.id).await?;
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let plan = &view.plan;
    println!("Plan:        {}", plan.id);
    println!("Model:       {}@{}", plan.model_id, plan.version);
    println!("Environment: {}", plan.environment);
    println!("Strategy:    {}", plan.strategy);
    println!("State:       {}", view.state);
    if let Some(reason) = &view.wait_reason {
        println!("Waiting:     {}", reason);
    }
    if !plan.reason.is_empty() {
        println!("Reason:      {}", plan.reason);
    }
    if let Some(approval) = &plan.approval {
        println!("Approved:    by {} at {}", approval.approver, approval.decided_at.to_rfc3339());
    }
    if let Some(rejection) = &plan.rejection {
        let comment = rejection.comment.as_deref().unwrap_or("");
        println!("Rejected:    by {} at {} {}", rejection.approver, rejection.decided_at.to_rfc3339(), comment);
    }
    if !view.executions.is_empty() {
        println!("Executions:");
        for id in &view.executions {
            println!("  - {}", id);
        }
    }
    Ok(())
}

pub async fn approve(args: ApproveArgs, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    let outcome = client.approve(args.plan_id, &args.approver).await?;
    println!("✅ Plan {} approved by {}: {}", args.plan_id, args.approver, describe_outcome(&outcome));
    Ok(())
}

pub async fn reject(args: RejectArgs, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    client.reject(args.plan_id, &args.approver, &args.reason).await?;
    println!("Plan {} rejected by {}", args.plan_id, args.approver);
    Ok(())
}

pub async fn cancel(args: CancelArgs, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    let execution = client.cancel(args.execution_id, &args.reason).await?;
    println!("Execution {} is now {}", execution.id, execution.status.as_str());
    Ok(())
}

pub async fn status(args: StatusArgs, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    let execution = client.execution(args.execution_id).await?;
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }
    print_execution(&execution);
    Ok(())
}

fn print_execution(execution: &DeploymentExecution) {
    println!("Execution:   {}", execution.id);
    println!("Plan:        {}", execution.plan_id);
    println!("Model:       {}@{}", execution.model_id, execution.version);
    println!("Environment: {}", execution.environment);
    println!("Status:      {}", execution.status.as_str());
    if let Some(failure) = &execution.failure {
        println!("Failed at:   {} ({})", failure.step, failure.message);
    }
    if let Some(reason) = &execution.cancel_reason {
        println!("Cancelled:   {}", reason);
    }
    println!();
    println!("{:<24}  {:<10}  {:>8}  {:>10}  {}", "STEP", "STATUS", "ATTEMPTS", "DURATION", "OUTPUT");
    println!("{}", "─".repeat(80));
    for step in &execution.steps {
        let duration = step
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let output = step.error.as_deref().or(step.output.as_deref()).unwrap_or("");
        println!(
            "{:<24}  {:<10}  {:>8}  {:>10}  {}",
            step.name,
            format!("{:?}", step.status).to_lowercase(),
            step.attempts,
            duration,
            output
        );
    }
}

pub async fn history(args: HistoryArgs, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    let executions = client.history(args.limit).await?;
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }
    if executions.is_empty() {
        println!("(no deployments yet)");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<9}  {:<11}  {:<12}  {}",
        "EXECUTION", "MODEL", "VERSION", "ENV", "STATUS", "CREATED"
    );
    println!("{}", "─".repeat(110));
    for e in &executions {
        println!(
            "{:<36}  {:<20}  {:<9}  {:<11}  {:<12}  {}",
            e.id,
            e.model_id,
            e.version.to_string(),
            e.environment.to_string(),
            e.status.as_str(),
            e.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_parse_from_cli_names() {
        assert_eq!(parse_strategy("immediate").unwrap(), DeploymentStrategy::Immediate);
        assert_eq!(parse_strategy("Blue-Green").unwrap(), DeploymentStrategy::BlueGreen);
        assert_eq!(
            parse_strategy("canary:25").unwrap(),
            DeploymentStrategy::Canary { percentage: 25 }
        );
    }

    #[test]
    fn canary_percentage_is_bounded() {
        assert!(parse_strategy("canary:0").is_err());
        assert!(parse_strategy("canary:150").is_err());
        assert!(parse_strategy("canary:x").is_err());
        assert!(parse_strategy("shadow").is_err());
    }
}
