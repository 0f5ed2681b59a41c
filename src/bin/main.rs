use fiscal_compliance_orchestrator::{
    agent::create_default_orchestrator,
    calendar::SystemClock,
    config::OrchestratorConfig,
    models::{Cadence, FinancialRecord, PeriodScope, RunRequest},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: orchestrator <monthly|quarterly|annual|strategic> <year> [month|quarter] [--records <file.json>]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = parse_request(&args).await.map_err(|e| format!("{}\n{}", e, USAGE))?;

    let config = OrchestratorConfig::from_env()?;
    let orchestrator = create_default_orchestrator(&config, Arc::new(SystemClock)).await?;

    info!(period = %request.period.label(), "Running fiscal pipeline");

    let outcome = orchestrator.run(request).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if let Some(failure) = &outcome.context.failure {
        eprintln!("Run failed at {}: {}", failure.stage, failure.reason);
        std::process::exit(1);
    }

    Ok(())
}

async fn parse_request(args: &[String]) -> Result<RunRequest, Box<dyn std::error::Error>> {
    let mut positional = Vec::new();
    let mut records_path = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--records" {
            records_path = Some(iter.next().ok_or("--records needs a file path")?.clone());
        } else {
            positional.push(arg.as_str());
        }
    }

    let cadence: Cadence = positional.first().ok_or("missing cadence")?.parse()?;
    let year: i32 = positional.get(1).ok_or("missing year")?.parse()?;
    let part: Option<u32> = positional.get(2).map(|p| p.parse()).transpose()?;

    let period = match (cadence, part) {
        (Cadence::Monthly, Some(month)) => PeriodScope::monthly(year, month)?,
        (Cadence::Quarterly, Some(quarter)) => PeriodScope::quarterly(year, quarter)?,
        (Cadence::Monthly | Cadence::Quarterly, None) => return Err("missing month or quarter".into()),
        (Cadence::Annual, _) => PeriodScope::annual(year)?,
        (Cadence::Strategic, _) => PeriodScope::strategic(year)?,
    };

    let mut request = RunRequest::new(period);
    if let Some(path) = records_path {
        let json = tokio::fs::read_to_string(&path).await?;
        let records: Vec<FinancialRecord> = serde_json::from_str(&json)?;
        request = request.with_records(records);
    }

    Ok(request)
}
