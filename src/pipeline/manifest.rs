use crate::{JobContext, PreviewMode};

pub const EMBED_FILE_NAME: &str = "embed.html";

/// HTML `<img>` snippet for the published set. When a preview exists it becomes the
/// `src` and the variants go into `data-srcset` for the async loader to swap in.
pub fn embed_snippet(ctx: &JobContext) -> String {
    let with_preview = ctx.preview != PreviewMode::None && ctx.trail.contains(&"generate_preview");
    let src = if with_preview {
        ctx.preview_file_name()
    } else {
        ctx.original_file_name()
    };

    let mut snippet = format!(
        "<!-- generated for {}{}; update the source URLs and add an alt attribute -->\n<img src=\"./{}\"",
        ctx.base_name, ctx.extension, src
    );

    if !ctx.requested_variants.is_empty() {
        let srcset = ctx
            .requested_variants
            .iter()
            .map(|&class| format!("./{} {}w", ctx.variant_file_name(class), class.width()))
            .collect::<Vec<_>>()
            .join(", ");
        let sizes = ctx
            .requested_variants
            .iter()
            .map(|class| format!("(max-width: {w}px) {w}px", w = class.width()))
            .collect::<Vec<_>>()
            .join(", ");
        let attr = if with_preview { "data-srcset" } else { "srcset" };
        snippet.push_str(&format!(" {attr}=\"{srcset}\" sizes=\"{sizes}\""));
    }

    snippet.push_str(" />\n");
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageKind, JobId, MimeClass, SizeClass};
    use std::path::PathBuf;

    fn context(variants: &[SizeClass], preview: PreviewMode, trail: Vec<&'static str>) -> JobContext {
        JobContext {
            id: JobId::parse("snippet").unwrap(),
            base_name: "beach".into(),
            extension: ".jpg".into(),
            kind: ImageKind::Jpeg,
            mime_class: MimeClass::Raster,
            source_file: PathBuf::from("beach-original.jpg"),
            requested_variants: variants.iter().copied().collect(),
            preview,
            working_dir: PathBuf::new(),
            publish_dir: PathBuf::new(),
            source_width: Some(3000),
            trail,
            stage_errors: Vec::new(),
        }
    }

    #[test]
    fn variants_are_listed_ascending_without_trailing_separator() {
        let ctx = context(
            &[SizeClass::Large, SizeClass::XSmall, SizeClass::Medium],
            PreviewMode::Blur,
            vec!["generate_preview"],
        );
        let snippet = embed_snippet(&ctx);

        assert!(snippet.contains("src=\"./beach-async.jpg\""));
        assert!(snippet.contains(
            "data-srcset=\"./beach-xsmall.jpg 320w, ./beach-medium.jpg 960w, ./beach-large.jpg 1280w\""
        ));
        assert!(snippet.contains(
            "sizes=\"(max-width: 320px) 320px, (max-width: 960px) 960px, (max-width: 1280px) 1280px\""
        ));
    }

    #[test]
    fn original_is_the_source_without_preview() {
        let ctx = context(&[SizeClass::Small], PreviewMode::None, vec![]);
        let snippet = embed_snippet(&ctx);

        assert!(snippet.contains("src=\"./beach-original.jpg\""));
        assert!(snippet.contains(" srcset=\"./beach-small.jpg 480w\""));
        assert!(!snippet.contains("data-srcset"));
    }

    #[test]
    fn no_variants_means_no_source_set() {
        let ctx = context(&[], PreviewMode::None, vec![]);
        assert!(!embed_snippet(&ctx).contains("srcset"));
    }
}
