use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vodgrab::cli::{Args, PlaylistInput};
use vodgrab::input::input_handler;
use vodgrab::logging::init_logging;
use vodgrab::render::render_progress;
use vodgrab::AppError;
use vodgrab_engine::playlist::{PlaylistOptions, load_segment_groups, parse_segment_groups};
use vodgrab_engine::{
    ChunkedDownloader, DownloadError, DownloadOptions, EngineConfig, HttpChunkSource,
    retain_content_groups,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = match init_logging(args.verbose, args.quiet, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppError::Download(DownloadError::Aborted)) => {
            eprintln!("Interrupted, partial output is left on disk.");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Cancels `interrupt` on Ctrl+C delivered as a signal.
async fn interrupt_on_signal(interrupt: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Interrupt received, stopping download");
        interrupt.cancel();
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    let config = EngineConfig::default();
    let client = config.http.build_client()?;
    let playlist_options = PlaylistOptions {
        rewrite_muted: !args.no_muted_rewrite,
    };

    let groups = match args.playlist_input()? {
        PlaylistInput::Remote(url) => {
            info!(%url, "Loading playlist");
            load_segment_groups(&client, &url, &playlist_options).await?
        }
        PlaylistInput::Local { path, base_url } => {
            info!(path = %path.display(), "Reading playlist");
            let content = tokio::fs::read(&path).await?;
            parse_segment_groups(&content, &base_url, &playlist_options)?
        }
    };
    let groups = retain_content_groups(groups, args.min_group_len);
    if groups.is_empty() {
        return Err(AppError::InvalidInput(
            "playlist contains no downloadable segment groups".to_string(),
        ));
    }

    let (progress_tx, progress_rx) = mpsc::channel(config.progress.channel_capacity);
    let mut downloader = ChunkedDownloader::new(
        groups,
        &args.output,
        DownloadOptions {
            thread_count: args.threads,
            target_kbps: args.limit,
        },
    )
    .with_config(config.clone())
    .with_source(Arc::new(HttpChunkSource::new(client)));

    let interrupt = CancellationToken::new();
    downloader = downloader.with_cancellation(interrupt.clone());
    let signal_task = tokio::spawn(interrupt_on_signal(interrupt.clone()));

    let input_token = CancellationToken::new();
    let input_task = if std::io::stdin().is_terminal() && !args.json {
        let (command_tx, command_rx) = mpsc::channel(16);
        downloader = downloader.with_commands(command_rx);
        Some(tokio::spawn(input_handler(
            command_tx,
            interrupt.clone(),
            input_token.clone(),
        )))
    } else {
        None
    };

    if args.variable {
        downloader
            .controller()
            .enable_variable_limit(config.speed_limit.default_percent);
    }

    for path in downloader.output_files() {
        info!(path = %path.display(), "Output file");
    }

    let renderer = tokio::spawn(render_progress(progress_rx, args.json));
    let result = downloader.start(Some(progress_tx)).await;

    input_token.cancel();
    signal_task.abort();
    if let Some(task) = input_task {
        let _ = task.await;
    }
    let _ = renderer.await;

    let summary = result?;
    info!(
        chunks = summary.chunks,
        bytes = summary.bytes_written,
        elapsed_secs = summary.elapsed.as_secs(),
        "Download complete"
    );
    for file in &summary.files {
        println!("{}", file.display());
    }
    Ok(())
}
