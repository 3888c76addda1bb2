use anyhow::{bail, Context, Result};
use coldstart_bench::{
    aggregate::{write_report, PricingTable},
    run_spec::build_id_from_key,
    AwsCliLifecycle, BlobStore, DirBlobStore, MeasureConfig, MeasureRequest, Orchestrator,
    RedisBlobStore, RunSpec,
};
use log::{info, warn};

struct Args {
    run_spec: String,
    function: String,
    build: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = get_args()?;
    let config = MeasureConfig::from_env()?;

    let bytes = tokio::fs::read(&args.run_spec)
        .await
        .with_context(|| format!("unable to read run spec {}", args.run_spec))?;
    let spec = RunSpec::from_json(&bytes)?;
    let build = match args.build {
        Some(build) => build,
        None => build_id_from_key(&args.run_spec)
            .with_context(|| format!("no build id in {}", args.run_spec))?,
    };
    let request = MeasureRequest::new(build, args.function, spec)?;

    match config.state_dir.clone() {
        Some(dir) => {
            info!("Keeping measurements in {dir}");
            run(DirBlobStore::new(dir), config, request).await
        }
        None => {
            let store = RedisBlobStore::open(&config.redis_url)?;
            run(store, config, request).await
        }
    }
}

async fn run<B: BlobStore>(store: B, config: MeasureConfig, request: MeasureRequest) -> Result<()> {
    let build = request.build().to_string();
    let cooldown = config.rate_limit_cooldown();
    let lifecycle = AwsCliLifecycle::new(config.region.clone());
    let orchestrator = Orchestrator::with_tokio(lifecycle, store, config);

    loop {
        let verdict = orchestrator.measure(&request).await?;
        if verdict.rate_limited {
            warn!(
                "Rate limited after {} samples, cooling down for {} seconds..",
                verdict.samples,
                cooldown.as_secs()
            );
            tokio::time::sleep(cooldown).await;
            continue;
        }
        if !verdict.should_continue {
            info!("Measured {} of {} samples for {build}", verdict.samples, verdict.target);
            break;
        }
        if verdict.collected == 0 {
            bail!("no progress measuring {build}; is the execution budget too small?");
        }
    }

    match write_report(orchestrator.states(), &[build.clone()], &PricingTable::us_east_1()).await? {
        Some(report) => {
            info!("Report saved as {}", report.key);
            print!("{}", report.csv);
        }
        None => warn!("No measurements saved for {build}"),
    }
    Ok(())
}

fn get_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let (Some(run_spec), Some(function)) = (args.next(), args.next()) else {
        bail!("usage: measure <run-spec.json> <function-name> [build-id]");
    };
    Ok(Args {
        run_spec,
        function,
        build: args.next(),
    })
}
