//! The ordered stage chain every image job runs through.

mod manifest;
mod stages;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

pub use manifest::{embed_snippet, EMBED_FILE_NAME};
pub use stages::{Archive, EmitManifest, GeneratePreview, Optimize, ResizeVariants, ValidateVariants};

use crate::codec::Codec;
use crate::error::{StageCause, StageFault};
use crate::job::StageError;
use crate::preview::PreviewParams;
use crate::store::ContentStore;
use crate::JobContext;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the stage runs for this context. Skipped stages pass the context through.
    fn applies(&self, _ctx: &JobContext) -> bool {
        true
    }

    /// Called instead of [`Stage::run`] when the stage does not apply.
    fn on_skip(&self, _ctx: &mut JobContext) {}

    /// A failing fatal stage ends the job. Non-fatal failures are logged and swallowed.
    fn fatal(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StageCause>;
}

#[derive(Debug)]
pub enum Outcome {
    Published(JobContext),
    /// Carries the context with its non-empty `stage_errors`.
    Failed(JobContext),
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// validate → resize → preview → optimize → manifest → archive
    pub fn standard(codec: Arc<dyn Codec>, store: ContentStore, params: Arc<PreviewParams>) -> Self {
        Self::new(vec![
            Box::new(ValidateVariants::new(codec.clone())),
            Box::new(ResizeVariants::new(codec.clone())),
            Box::new(GeneratePreview::new(codec.clone(), params)),
            Box::new(Optimize::new(codec.clone())),
            Box::new(EmitManifest),
            Box::new(Archive::new(codec, store)),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn run(&self, mut ctx: JobContext) -> Outcome {
        for stage in &self.stages {
            let name = stage.name();
            if !stage.applies(&ctx) {
                debug!(job_id = %ctx.id, stage = name, "stage skipped");
                stage.on_skip(&mut ctx);
                continue;
            }

            debug!(job_id = %ctx.id, stage = name, "stage started");
            let result = stage.run(&mut ctx).await;
            ctx.trail.push(name);

            if let Err(cause) = result {
                let fault = StageFault { stage: name, cause };
                if stage.fatal() {
                    error!(job_id = %ctx.id, stage = name, error = %fault, "stage fault, dropping job");
                    ctx.stage_errors.push(StageError::from(&fault));
                    return Outcome::Failed(ctx);
                }
                warn!(job_id = %ctx.id, stage = name, error = %fault, "manifest fault, continuing");
            }
        }
        Outcome::Published(ctx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::error::CodecError;
    use crate::preview::PreviewStyle;
    use crate::{ImageKind, JobId, JobTicket, PreviewMode, SizeClass};
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes placeholder bytes instead of real images and can fail on demand.
    pub(crate) struct FakeCodec {
        pub width: u32,
        pub fail_on: Option<&'static str>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeCodec {
        pub(crate) fn new(width: u32) -> Self {
            Self {
                width,
                fail_on: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(width: u32, op: &'static str) -> Self {
            Self {
                fail_on: Some(op),
                ..Self::new(width)
            }
        }

        fn call(&self, op: &'static str, detail: String) -> Result<(), CodecError> {
            self.calls.lock().unwrap().push(format!("{op} {detail}"));
            if self.fail_on == Some(op) {
                return Err(CodecError::Unsupported(format!("{op} refused")));
            }
            Ok(())
        }
    }

    fn name(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    impl Codec for FakeCodec {
        fn dimensions(&self, src: &Path) -> Result<(u32, u32), CodecError> {
            self.call("dimensions", name(src))?;
            Ok((self.width, self.width / 2))
        }

        fn resize(&self, src: &Path, dst: &Path, width: u32) -> Result<(), CodecError> {
            self.call("resize", format!("{} {width}", name(src)))?;
            std::fs::write(dst, b"resized")?;
            Ok(())
        }

        fn preview(&self, _src: &Path, dst: &Path, _style: &PreviewStyle) -> Result<(), CodecError> {
            self.call("preview", name(dst))?;
            std::fs::write(dst, b"preview")?;
            Ok(())
        }

        fn optimize(&self, src: &Path, dst: &Path, _kind: Option<ImageKind>) -> Result<(), CodecError> {
            self.call("optimize", name(src))?;
            std::fs::copy(src, dst)?;
            Ok(())
        }

        fn archive(&self, dir: &Path, dst: &Path) -> Result<(), CodecError> {
            self.call("archive", name(dir))?;
            std::fs::write(dst, b"zip")?;
            Ok(())
        }
    }

    pub(crate) async fn seeded_job(
        store: &ContentStore,
        raw_id: &str,
        extension: &str,
        variants: &[SizeClass],
        preview: PreviewMode,
    ) -> JobTicket {
        let ticket = JobTicket {
            id: JobId::parse(raw_id).unwrap(),
            base_name: "cat".into(),
            extension: extension.into(),
            kind: ImageKind::from_extension(extension).unwrap(),
            variants: variants.iter().copied().collect::<BTreeSet<_>>(),
            preview,
        };
        let (working, _) = store.allocate(&ticket.id).await.unwrap().unwrap();
        tokio::fs::write(working.join(ticket.original_file_name()), b"source")
            .await
            .unwrap();
        ticket
    }

    async fn fixture(codec: FakeCodec) -> (TempDir, ContentStore, Pipeline) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let pipeline = Pipeline::standard(Arc::new(codec), store.clone(), Arc::new(PreviewParams::seeded(1)));
        (dir, store, pipeline)
    }

    #[tokio::test]
    async fn raster_job_runs_every_stage_in_order() {
        let (_dir, store, pipeline) = fixture(FakeCodec::new(2000)).await;
        let ticket = seeded_job(
            &store,
            "raster1",
            ".jpg",
            &[SizeClass::Small, SizeClass::Retina],
            PreviewMode::Blur,
        )
        .await;

        let Outcome::Published(ctx) = pipeline.run(JobContext::from_ticket(ticket, &store)).await else {
            panic!("job failed");
        };

        assert_eq!(ctx.trail, pipeline.stage_names());
        assert_eq!(ctx.source_width, Some(2000));
        assert_eq!(ctx.requested_variants.iter().copied().collect::<Vec<_>>(), vec![SizeClass::Small]);
        assert!(ctx.publish_dir.join("cat-small.jpg").exists());
        assert!(ctx.publish_dir.join("cat-async.jpg").exists());
        assert!(ctx.publish_dir.join("cat-original.jpg").exists());
        assert!(ctx.publish_dir.join(EMBED_FILE_NAME).exists());
        assert!(!ctx.publish_dir.join("cat-retina.jpg").exists());
        assert!(store.archive_path(&ctx.id).exists());
    }

    #[tokio::test]
    async fn vector_job_skips_resize_and_preview() {
        let (_dir, store, pipeline) = fixture(FakeCodec::new(2000)).await;
        let ticket = seeded_job(&store, "vector1", ".svg", &[SizeClass::Small], PreviewMode::Tessellate).await;

        let Outcome::Published(ctx) = pipeline.run(JobContext::from_ticket(ticket, &store)).await else {
            panic!("job failed");
        };

        assert_eq!(ctx.trail, vec!["optimize", "emit_manifest", "archive"]);
        assert!(ctx.requested_variants.is_empty());
        assert!(!ctx.publish_dir.join("cat-async.svg").exists());
        assert!(store.archive_path(&ctx.id).exists());
    }

    #[tokio::test]
    async fn fatal_failure_stops_the_chain_before_archive() {
        let (_dir, store, pipeline) = fixture(FakeCodec::failing(2000, "optimize")).await;
        let ticket = seeded_job(&store, "broken1", ".png", &[SizeClass::Medium], PreviewMode::None).await;

        let Outcome::Failed(ctx) = pipeline.run(JobContext::from_ticket(ticket, &store)).await else {
            panic!("job should fail");
        };

        assert_eq!(ctx.stage_errors.len(), 1);
        assert_eq!(ctx.stage_errors[0].stage, "optimize");
        assert!(ctx.is_failed());
        assert!(!ctx.trail.contains(&"archive"));
        assert!(!store.archive_path(&ctx.id).exists());
    }

    #[tokio::test]
    async fn manifest_failure_is_not_fatal() {
        let (_dir, store, pipeline) = fixture(FakeCodec::new(600)).await;
        let ticket = seeded_job(&store, "nomanifest", ".jpg", &[], PreviewMode::None).await;
        // A directory where the snippet should go makes the write fail.
        tokio::fs::create_dir_all(store.publish_dir(&ticket.id).join(EMBED_FILE_NAME))
            .await
            .unwrap();

        let outcome = pipeline.run(JobContext::from_ticket(ticket, &store)).await;

        let Outcome::Published(ctx) = outcome else {
            panic!("manifest failure must not fail the job");
        };
        assert!(ctx.stage_errors.is_empty());
        assert!(store.archive_path(&ctx.id).exists());
    }
}
