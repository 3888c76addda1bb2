use anyhow::{Context as _, Result};
use coldstart_bench::{
    aggregate::{combine_csv, write_report, PricingTable},
    run_spec::build_id_from_key,
    AwsCliLifecycle, BlobStore, MeasureConfig, MeasureError, MeasureRequest, Orchestrator,
    RedisBlobStore, RunSpec,
};
use futures::{stream::FuturesOrdered, TryStreamExt};
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use warp::{http::StatusCode, Filter};

struct Context {
    orchestrator: Orchestrator<AwsCliLifecycle, RedisBlobStore>,
    pricing: PricingTable,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeasureBody {
    /// Blob key of the run spec; its file stem is the build id.
    run_spec_key: String,
    function: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct MeasureResponse {
    success: bool,
    message: String,
    #[serde(rename = "continue")]
    should_continue: bool,
    rate_limited: bool,
    samples: usize,
}

#[derive(Deserialize)]
struct CombineBody {
    builds: Vec<String>,
}

#[derive(Deserialize)]
struct CombineReportsBody {
    reports: Vec<String>,
    output: String,
}

#[derive(Serialize)]
struct CombineResponse {
    success: bool,
    message: String,
    key: Option<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    pretty_env_logger::init();
    let config = MeasureConfig::from_env()?;
    let port = config.listen_port;
    let store = RedisBlobStore::open(&config.redis_url)?;
    let lifecycle = AwsCliLifecycle::new(config.region.clone());
    let context = Arc::new(Context {
        orchestrator: Orchestrator::with_tokio(lifecycle, store, config),
        pricing: PricingTable::us_east_1(),
    });
    let with_context = warp::any().map(move || context.clone());

    let cors = warp::cors().allow_any_origin();

    let measure = warp::path("measure")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context.clone())
        .and_then(post_measure)
        .with(&cors);

    let combine_reports = warp::path!("combine" / "reports")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context.clone())
        .and_then(post_combine_reports)
        .with(&cors);

    let combine = warp::path("combine")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context.clone())
        .and_then(post_combine)
        .with(&cors);

    let run = warp::path("runs")
        .and(warp::path::param())
        .and(warp::get())
        .and(with_context)
        .and_then(get_run)
        .with(&cors);

    let route = measure.or(combine_reports).or(combine).or(run);

    info!("Listening on port {port}");
    warp::serve(route).run(([0, 0, 0, 0], port)).await;
    Ok(())
}

async fn post_measure(
    body: MeasureBody,
    context: Arc<Context>,
) -> Result<impl warp::Reply, Infallible> {
    let (status, response) = match measure(&body, &context).await {
        Ok(verdict) => (
            StatusCode::OK,
            MeasureResponse {
                success: true,
                message: format!("{} of {} samples", verdict.samples, verdict.target),
                should_continue: verdict.should_continue,
                rate_limited: verdict.rate_limited,
                samples: verdict.samples,
            },
        ),
        Err(e) => {
            warn!("Measurement for {} failed: {e:#}", body.run_spec_key);
            let status = match e.downcast_ref::<MeasureError>() {
                Some(MeasureError::Validation(_)) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                MeasureResponse {
                    message: format!("{e:#}"),
                    ..Default::default()
                },
            )
        }
    };

    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}

async fn measure(
    body: &MeasureBody,
    context: &Context,
) -> Result<coldstart_bench::Verdict> {
    let states = context.orchestrator.states();
    let bytes = states
        .blobs()
        .get(&body.run_spec_key)
        .await?
        .with_context(|| format!("no run spec at {}", body.run_spec_key))?;
    let spec = RunSpec::from_json(&bytes).map_err(MeasureError::from)?;
    let build = build_id_from_key(&body.run_spec_key)
        .with_context(|| format!("no build id in {}", body.run_spec_key))?;
    let request =
        MeasureRequest::new(build, body.function.as_str(), spec).map_err(MeasureError::from)?;
    Ok(context.orchestrator.measure(&request).await?)
}

async fn post_combine(
    body: CombineBody,
    context: Arc<Context>,
) -> Result<impl warp::Reply, Infallible> {
    let states = context.orchestrator.states();
    let response = match write_report(states, &body.builds, &context.pricing).await {
        Ok(Some(report)) => CombineResponse {
            success: true,
            message: format!("combined {} builds", report.builds),
            key: Some(report.key),
        },
        Ok(None) => CombineResponse {
            success: false,
            message: "no measurements found".to_string(),
            key: None,
        },
        Err(e) => {
            warn!("Combining {} builds failed: {e:#}", body.builds.len());
            CombineResponse {
                success: false,
                message: format!("{e:#}"),
                key: None,
            }
        }
    };

    Ok(warp::reply::json(&response))
}

async fn post_combine_reports(
    body: CombineReportsBody,
    context: Arc<Context>,
) -> Result<impl warp::Reply, Infallible> {
    let response = match combine_reports(&body, &context).await {
        Ok(()) => CombineResponse {
            success: true,
            message: format!("combined {} reports", body.reports.len()),
            key: Some(body.output.clone()),
        },
        Err(e) => {
            warn!("Combining reports into {} failed: {e:#}", body.output);
            CombineResponse {
                success: false,
                message: format!("{e:#}"),
                key: None,
            }
        }
    };

    Ok(warp::reply::json(&response))
}

async fn combine_reports(body: &CombineReportsBody, context: &Context) -> Result<()> {
    let store = context.orchestrator.states().blobs();
    let files: Vec<String> = body
        .reports
        .iter()
        .map(|key| fetch_text(store, key))
        .collect::<FuturesOrdered<_>>()
        .try_collect()
        .await?;
    let combined = combine_csv(&files)?;
    store.put(&body.output, combined.into_bytes()).await
}

async fn fetch_text(store: &RedisBlobStore, key: &str) -> Result<String> {
    let bytes = store
        .get(key)
        .await?
        .with_context(|| format!("no report at {key}"))?;
    Ok(String::from_utf8(bytes)?)
}

async fn get_run(build: String, context: Arc<Context>) -> Result<impl warp::Reply, Infallible> {
    let response = match context.orchestrator.states().load(&build).await {
        Ok(Some(state)) => warp::reply::with_status(warp::reply::json(&state), StatusCode::OK),
        Ok(None) => warp::reply::with_status(
            warp::reply::json(&format!("no measurements for {build}")),
            StatusCode::NOT_FOUND,
        ),
        Err(e) => {
            warn!("Loading {build} failed: {e:#}");
            warp::reply::with_status(
                warp::reply::json(&format!("{e:#}")),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    };

    Ok(response)
}
