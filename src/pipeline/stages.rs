use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::fs;
use tokio::task::spawn_blocking;
use tracing::debug;

use super::manifest::{embed_snippet, EMBED_FILE_NAME};
use super::Stage;
use crate::codec::Codec;
use crate::error::{StageCause, StorageResultExt};
use crate::preview::PreviewParams;
use crate::store::ContentStore;
use crate::{ImageKind, JobContext, MimeClass, PreviewMode};

/// Drops every requested size class wider than the source. Never upscales.
pub struct ValidateVariants {
    codec: Arc<dyn Codec>,
}

impl ValidateVariants {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl Stage for ValidateVariants {
    fn name(&self) -> &'static str {
        "validate_variants"
    }

    fn applies(&self, ctx: &JobContext) -> bool {
        ctx.mime_class == MimeClass::Raster
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StageCause> {
        let codec = self.codec.clone();
        let source = ctx.source_file.clone();
        let (width, _) = spawn_blocking(move || codec.dimensions(&source)).await??;

        ctx.source_width = Some(width);
        let before = ctx.requested_variants.len();
        ctx.requested_variants.retain(|class| class.width() <= width);
        if ctx.requested_variants.len() < before {
            debug!(
                job_id = %ctx.id,
                source_width = width,
                kept = ?ctx.requested_variants,
                "dropped size classes wider than the source"
            );
        }
        Ok(())
    }
}

pub struct ResizeVariants {
    codec: Arc<dyn Codec>,
}

impl ResizeVariants {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl Stage for ResizeVariants {
    fn name(&self) -> &'static str {
        "resize_variants"
    }

    fn applies(&self, ctx: &JobContext) -> bool {
        ctx.mime_class == MimeClass::Raster
    }

    fn on_skip(&self, ctx: &mut JobContext) {
        // Vector and animated sources never get variant files.
        ctx.requested_variants.clear();
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StageCause> {
        let resizes = ctx.requested_variants.iter().map(|&class| {
            let codec = self.codec.clone();
            let source = ctx.source_file.clone();
            let target = ctx.working_dir.join(ctx.variant_file_name(class));
            async move {
                spawn_blocking(move || codec.resize(&source, &target, class.width())).await??;
                Ok::<_, StageCause>(())
            }
        });
        try_join_all(resizes).await?;
        Ok(())
    }
}

/// Writes the `-async` stylized copy used as a progressive-loading placeholder.
pub struct GeneratePreview {
    codec: Arc<dyn Codec>,
    params: Arc<PreviewParams>,
}

impl GeneratePreview {
    pub fn new(codec: Arc<dyn Codec>, params: Arc<PreviewParams>) -> Self {
        Self { codec, params }
    }
}

#[async_trait]
impl Stage for GeneratePreview {
    fn name(&self) -> &'static str {
        "generate_preview"
    }

    fn applies(&self, ctx: &JobContext) -> bool {
        ctx.mime_class == MimeClass::Raster && ctx.preview != PreviewMode::None
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StageCause> {
        let Some(style) = self.params.style_for(ctx.preview) else {
            return Ok(());
        };
        debug!(job_id = %ctx.id, style = ?style, "rendering preview");

        let codec = self.codec.clone();
        let source = ctx.source_file.clone();
        let target = ctx.working_dir.join(ctx.preview_file_name());
        spawn_blocking(move || codec.preview(&source, &target, &style)).await??;
        Ok(())
    }
}

/// Recompresses the whole working directory into the publish directory.
pub struct Optimize {
    codec: Arc<dyn Codec>,
}

impl Optimize {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl Stage for Optimize {
    fn name(&self) -> &'static str {
        "optimize"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StageCause> {
        fs::create_dir_all(&ctx.publish_dir)
            .await
            .storage("create", &ctx.publish_dir)?;

        let mut files: Vec<PathBuf> = Vec::new();
        let mut entries = fs::read_dir(&ctx.working_dir)
            .await
            .storage("list", &ctx.working_dir)?;
        while let Some(entry) = entries.next_entry().await.storage("list", &ctx.working_dir)? {
            let is_file = entry
                .file_type()
                .await
                .storage("stat", entry.path())?
                .is_file();
            if is_file {
                files.push(entry.path());
            }
        }
        files.sort();

        for source in files {
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = ctx.publish_dir.join(name);
            let kind = ImageKind::from_path(&source);
            let codec = self.codec.clone();
            spawn_blocking(move || codec.optimize(&source, &target, kind)).await??;
        }
        Ok(())
    }
}

/// Writes the HTML embed snippet. Failing here never fails the job.
pub struct EmitManifest;

#[async_trait]
impl Stage for EmitManifest {
    fn name(&self) -> &'static str {
        "emit_manifest"
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StageCause> {
        let path = ctx.publish_dir.join(EMBED_FILE_NAME);
        fs::write(&path, embed_snippet(ctx))
            .await
            .storage("write", &path)?;
        Ok(())
    }
}

/// Zips the publish directory. Renaming the finished archive into place is what
/// makes the id ready.
pub struct Archive {
    codec: Arc<dyn Codec>,
    store: ContentStore,
}

impl Archive {
    pub fn new(codec: Arc<dyn Codec>, store: ContentStore) -> Self {
        Self { codec, store }
    }
}

#[async_trait]
impl Stage for Archive {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StageCause> {
        let codec = self.codec.clone();
        let dir = ctx.publish_dir.clone();
        let partial = self.store.partial_archive_path(&ctx.id);
        spawn_blocking(move || codec.archive(&dir, &partial)).await??;

        let archive = self.store.commit_archive(&ctx.id).await?;
        debug!(job_id = %ctx.id, archive = %archive.display(), "archive published");
        Ok(())
    }
}
