//! Input submission.
//!
//! Every interaction with the generation surface goes through a prioritized
//! locator chain, so one markup change does not break the step. All failures
//! here classify as [`ConvertError::Submission`]; the orchestrator decides
//! what a failed submission costs.

use std::path::Path;

use tracing::{debug, info};

use cdp_driver::{Driver, Locator};

use crate::errors::ConvertError;

/// Service default; requesting it again is a wasted click.
pub const DEFAULT_ASPECT_RATIO: &str = "9:16";

pub fn prompt_field() -> Locator {
    Locator::new("prompt field")
        .css("textarea[placeholder*='describe' i]")
        .css("textarea[placeholder*='imagine' i]")
        .css("textarea")
        .css("div[contenteditable='true']")
        .aria_label("prompt")
}

fn video_mode_toggle() -> Locator {
    Locator::new("video mode toggle")
        .css("button[data-mode='video']")
        .text_exact("button,div[role='button'],span", "Video")
        .aria_label("video")
}

fn image_mode_toggle() -> Locator {
    Locator::new("image mode toggle")
        .css("button[data-mode='image']")
        .text_exact("button,div[role='button'],span", "Image")
        .aria_label("image")
}

fn aspect_ratio_option(ratio: &str) -> Locator {
    Locator::new(format!("aspect ratio {ratio}"))
        .css(format!("button[data-ratio='{ratio}']"))
        .text_exact("button,div[role='button'],span", ratio)
        .aria_label(ratio)
}

fn file_input() -> Locator {
    Locator::new("image upload input")
        .css("input[type='file'][accept*='image']")
        .css("input[type='file']")
}

/// The artifact's download control. Only consulted as a discovery fallback:
/// some builds expose no `href` anywhere and the URL is learned by letting
/// the click start (and the driver cancel) a transfer.
pub fn download_button() -> Locator {
    Locator::new("download button")
        .css("button[data-testid*='download']")
        .aria_label("download")
        .text("button,div[role='button']", "Download")
}

fn generate_button() -> Locator {
    Locator::new("generate button")
        .css("button[type='submit']")
        .text("button", "Generate")
        .text("button,div[role='button']", "Make video")
        .aria_label("generate")
}

fn submission(err: cdp_driver::DriverError, step: &str) -> ConvertError {
    ConvertError::Submission(format!("{step}: {err}"))
}

pub async fn select_mode(driver: &dyn Driver, video: bool) -> Result<(), ConvertError> {
    let locator = if video {
        video_mode_toggle()
    } else {
        image_mode_toggle()
    };
    // The toggle is absent on some builds where video is already the default;
    // only an unresolvable-and-required click is an error.
    match driver.resolve(&locator).await {
        Ok(Some(_)) => {
            driver
                .click(&locator)
                .await
                .map_err(|err| submission(err, "mode toggle"))?;
            debug!(target: "reelforge", video, "mode selected");
        }
        Ok(None) => debug!(target: "reelforge", "mode toggle not present; assuming default"),
        Err(err) => return Err(submission(err, "mode toggle")),
    }
    Ok(())
}

/// Click the requested aspect ratio. Skipped when it matches the service
/// default.
pub async fn select_aspect_ratio(driver: &dyn Driver, ratio: &str) -> Result<(), ConvertError> {
    if ratio == DEFAULT_ASPECT_RATIO {
        debug!(target: "reelforge", ratio, "aspect ratio is the default; skipping");
        return Ok(());
    }
    driver
        .click(&aspect_ratio_option(ratio))
        .await
        .map_err(|err| submission(err, "aspect ratio"))?;
    Ok(())
}

pub async fn enter_prompt(driver: &dyn Driver, prompt: &str) -> Result<(), ConvertError> {
    driver
        .set_value(&prompt_field(), prompt)
        .await
        .map_err(|err| submission(err, "prompt entry"))?;
    debug!(target: "reelforge", chars = prompt.len(), "prompt entered");
    Ok(())
}

pub async fn upload_image(driver: &dyn Driver, path: &Path) -> Result<(), ConvertError> {
    if !path.exists() {
        return Err(ConvertError::Submission(format!(
            "input image not found: {}",
            path.display()
        )));
    }
    let absolute = path
        .canonicalize()
        .map_err(|err| ConvertError::Submission(format!("cannot resolve input path: {err}")))?;
    driver
        .upload_file(&file_input(), &absolute.to_string_lossy())
        .await
        .map_err(|err| submission(err, "image upload"))?;
    info!(target: "reelforge", path = %absolute.display(), "image uploaded");
    Ok(())
}

pub async fn trigger_generation(driver: &dyn Driver) -> Result<(), ConvertError> {
    driver
        .click(&generate_button())
        .await
        .map_err(|err| submission(err, "generate"))?;
    info!(target: "reelforge", "generation requested");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_lead_with_the_most_specific_strategy() {
        let js = generate_button().element_expression();
        let submit_at = js.find("button[type='submit']").expect("css first");
        let text_at = js.find("Generate").expect("text fallback");
        assert!(submit_at < text_at);
    }

    #[test]
    fn file_input_chain_prefers_image_accepting_inputs() {
        let locator = file_input();
        assert_eq!(locator.strategies.len(), 2);
        assert!(locator
            .element_expression()
            .contains("input[type='file'][accept*='image']"));
    }
}
