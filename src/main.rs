use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::warn;

use reelforge_cli::cli::{runtime, Cli, Command};
use reelforge_cli::{
    ArtifactRef, ConversionRequest, ConversionResult, GenerationMode, GenerationParams,
    InputSource, Pipeline,
};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    runtime::init_logging(&cli);

    let mut cfg = runtime::load_config(&cli)?;
    if let Command::Text { pattern: Some(pattern), .. } = &cli.command {
        cfg.output.naming_pattern = pattern.clone();
    }

    let driver = runtime::build_driver(&cfg);
    let pipeline = Arc::new(Pipeline::new(cfg, driver));

    {
        // Ctrl-C stops the session; in-flight waits observe the cancelled
        // token and batches truncate.
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(target: "reelforge", "interrupt received; stopping session");
                pipeline.shutdown().await;
            }
        });
    }

    let sink = runtime::StderrSink;
    let exit = match cli.command {
        Command::Convert {
            image,
            output,
            prompt,
            aspect_ratio,
        } => {
            let request = ConversionRequest {
                input: InputSource::Image(image),
                output_path: output,
                params: GenerationParams {
                    mode: GenerationMode::Video,
                    aspect_ratio,
                    prompt,
                },
            };
            let result = pipeline.convert(&request, &sink).await;
            pipeline.shutdown().await;
            report(&result)?
        }

        Command::Text {
            prompt,
            out_dir,
            aspect_ratio,
            pattern: _,
        } => {
            let params = GenerationParams {
                mode: GenerationMode::Video,
                aspect_ratio,
                prompt: None,
            };
            let result = pipeline.text_to_video(&prompt, &out_dir, params, &sink).await;
            pipeline.shutdown().await;
            report(&result)?
        }

        Command::Batch {
            images,
            out_dir,
            prompt,
        } => {
            let items: Vec<ConversionRequest> = images
                .iter()
                .map(|image| {
                    let stem = image
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "output".to_string());
                    ConversionRequest {
                        input: InputSource::Image(image.clone()),
                        output_path: out_dir.join(format!("{stem}.mp4")),
                        params: GenerationParams {
                            mode: GenerationMode::Video,
                            aspect_ratio: None,
                            prompt: prompt.clone(),
                        },
                    }
                })
                .collect();

            let results = pipeline.convert_batch(&items, &sink).await;
            pipeline.shutdown().await;

            let succeeded = results.iter().filter(|r| r.success).count();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "requested": items.len(),
                    "attempted": results.len(),
                    "succeeded": succeeded,
                    "results": results,
                }))
                .context("serializing batch results")?
            );
            if succeeded == items.len() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }

        Command::RetryDownload { url, output } => {
            let artifact = if url.starts_with("blob:") {
                ArtifactRef::InContext(url.clone())
            } else {
                ArtifactRef::Url(url.clone())
            };

            let success = match pipeline.session().start().await {
                Ok(()) => pipeline.downloads().retry_download(&artifact, &output).await,
                Err(err) => {
                    warn!(target: "reelforge", %err, "session start failed");
                    false
                }
            };
            pipeline.shutdown().await;

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "success": success,
                    "url": url,
                    "output": output,
                }))
                .context("serializing retry-download result")?
            );
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }

        Command::Validate => match pipeline.session().validate().await {
            Ok(session_report) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&session_report)
                        .context("serializing session report")?
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "running": false,
                        "error": err.to_string(),
                    }))
                    .context("serializing session report")?
                );
                ExitCode::FAILURE
            }
        },
    };

    Ok(exit)
}

fn report(result: &ConversionResult) -> anyhow::Result<ExitCode> {
    println!(
        "{}",
        serde_json::to_string_pretty(result).context("serializing conversion result")?
    );
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
