use std::time::Duration;

use futures::future::BoxFuture;
use pagecompiler_service::{CompileDriver, CompileError, CompileResult, Compiled};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// A set of workers requesting random pages of one synthetic document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    /// Number of requests in flight at any time.
    pub concurrency: usize,
    /// Number of pages in the document.
    pub pages: u32,
    /// How long compiling a single page takes.
    #[serde(with = "humantime_serde")]
    pub compile_time: Duration,
    /// Size of a compiled page in bytes.
    pub page_size: u64,
    /// Every page whose number is a multiple of this fails to compile.
    #[serde(default)]
    pub fail_every: Option<u32>,
    /// Number of following pages compiled along with each page.
    #[serde(default)]
    pub related_pages: u32,
}

/// What the document supplies for a page.
#[derive(Debug, Clone, Copy)]
pub struct PageDescription {
    page: u32,
    size: u64,
    corrupt: bool,
}

#[derive(Debug)]
pub struct SyntheticPage {
    pub page: u32,
    pub data: Vec<u8>,
}

/// Compiles pages by waiting for a while and rendering a buffer of the configured size.
#[derive(Debug, Clone)]
pub struct SyntheticDriver {
    workload: Workload,
}

impl SyntheticDriver {
    pub fn new(workload: Workload) -> Self {
        Self { workload }
    }

    fn describe(&self, page: u32) -> PageDescription {
        PageDescription {
            page,
            size: self.workload.page_size,
            corrupt: self
                .workload
                .fail_every
                .is_some_and(|every| every > 0 && page % every == 0),
        }
    }
}

async fn render(description: PageDescription) -> CompileResult<SyntheticPage> {
    let PageDescription { page, size, .. } = description;
    let data = tokio::task::spawn_blocking(move || {
        let fill = page.to_le_bytes();
        (0..size as usize)
            .map(|i| fill[i % fill.len()])
            .collect::<Vec<u8>>()
    })
    .await
    .map_err(CompileError::from_std_error)?;

    Ok(SyntheticPage { page, data })
}

impl CompileDriver for SyntheticDriver {
    type Key = u32;
    type Input = PageDescription;
    type Artifact = SyntheticPage;

    fn input(&self, key: &u32) -> PageDescription {
        self.describe(*key)
    }

    fn compile(
        &self,
        key: u32,
        input: PageDescription,
    ) -> BoxFuture<'static, CompileResult<Compiled<u32, SyntheticPage>>> {
        let compile_time = self.workload.compile_time;
        let related: Vec<_> = (1..=self.workload.related_pages)
            .map(|offset| key + offset)
            .filter(|page| *page < self.workload.pages)
            .map(|page| self.describe(page))
            .filter(|description| !description.corrupt)
            .collect();

        Box::pin(async move {
            tokio::time::sleep(compile_time).await;
            if input.corrupt {
                return Err(CompileError::Malformed(format!("page {key} is corrupt")));
            }

            let mut compiled = Compiled::new(render(input).await?);
            for description in related {
                compiled = compiled.with_related(description.page, render(description).await?);
            }
            Ok(compiled)
        })
    }

    fn weight(artifact: &SyntheticPage) -> u64 {
        artifact.data.len() as u64
    }
}
