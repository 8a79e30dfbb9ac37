use std::io::Write;
use std::time::Instant;

use bazi_stream::config::{load_config, AppConfig};
use bazi_stream::error::ErrorCategory;
use bazi_stream::observability::{init_tracing, log_analysis_outcome};
use bazi_stream::prompt::AnalysisRequest;
use bazi_stream::session::{
    run_analysis, CancelToken, FailureReport, RenderUpdate, Renderer, SessionOutcome,
};
use bazi_stream::transport::HttpTransport;

fn main() {
    let Some(request_path) = std::env::args().nth(1) else {
        eprintln!("Usage: bazi-stream <request.yaml>");
        std::process::exit(2);
    };

    let config = load_config("config.yaml").unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(2);
    });

    init_tracing(&config.features.log_level);

    let request = load_request(&request_path).unwrap_or_else(|e| {
        eprintln!("Failed to load analysis request '{request_path}': {e}");
        std::process::exit(2);
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });

    let code = runtime.block_on(run(config, request));
    std::process::exit(code);
}

fn load_request(path: &str) -> Result<AnalysisRequest, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_yaml::from_str(&contents).map_err(|e| e.to_string())
}

async fn run(config: AppConfig, request: AnalysisRequest) -> i32 {
    let transport = match HttpTransport::new(&config.upstream) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("Failed to create HTTP transport: {err}");
            return exit_code(err.category());
        }
    };

    tracing::info!(
        model = %config.upstream.model,
        url = %transport.url(),
        "bazi-stream requesting analysis"
    );

    let chat_request = request.to_chat_request(&config);
    let mut renderer = StdoutRenderer::default();
    let cancel = CancelToken::new();
    let interrupt = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
    let start_time = Instant::now();
    let outcome = run_analysis(
        &transport,
        &chat_request,
        &mut renderer,
        cancel,
        config.features.follow_interval(),
    )
    .await;
    interrupt.abort();
    log_analysis_outcome(&outcome, start_time);

    if matches!(outcome, SessionOutcome::Completed(_)) {
        println!();
    }
    outcome_exit_code(&outcome)
}

async fn cancel_on_ctrl_c(cancel: CancelToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            if cancel.cancel() {
                eprintln!();
                eprintln!("Analysis cancelled.");
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to listen for Ctrl-C"),
    }
}

fn outcome_exit_code(outcome: &SessionOutcome) -> i32 {
    match outcome {
        SessionOutcome::Completed(_) => 0,
        SessionOutcome::Failed(report) => exit_code(report.error.category()),
        SessionOutcome::Cancelled(_) => 130,
    }
}

fn exit_code(category: ErrorCategory) -> i32 {
    match category {
        ErrorCategory::Configuration => 2,
        ErrorCategory::Authentication => 3,
        ErrorCategory::RateLimit => 4,
        _ => 1,
    }
}

/// Prints newly appended text as it arrives: reasoning first, then the
/// answer after a blank line.
#[derive(Default)]
struct StdoutRenderer {
    reasoning_printed: usize,
    answer_printed: usize,
}

impl Renderer for StdoutRenderer {
    fn on_update(&mut self, update: &RenderUpdate) {
        let snapshot = &update.snapshot;
        let mut out = std::io::stdout().lock();

        if let Some(fresh) = snapshot.reasoning_text.get(self.reasoning_printed..) {
            let _ = out.write_all(fresh.as_bytes());
            self.reasoning_printed = snapshot.reasoning_text.len();
        }
        if let Some(fresh) = snapshot.answer_text.get(self.answer_printed..) {
            if self.answer_printed == 0 && !fresh.is_empty() && self.reasoning_printed > 0 {
                let _ = out.write_all(b"\n\n");
            }
            let _ = out.write_all(fresh.as_bytes());
            self.answer_printed = snapshot.answer_text.len();
        }
        let _ = out.flush();
    }

    fn on_failure(&mut self, report: &FailureReport) {
        println!();
        eprintln!("Analysis failed: {}", report.error);
    }
}
