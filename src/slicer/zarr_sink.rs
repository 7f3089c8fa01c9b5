//! Grouped container sink: one zarr store per fov, one named array per
//! channel.
//!
//! Layout: `<container_dir>/xy{fov:03}.zarr` holds arrays named
//! `channel_{id:04}` of shape `(pages, rows, cols)` with one chunk per
//! page. The sink is equivalent to the TIFF stack sink in content; the
//! choice between them is orthogonal to detection and alignment.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use zarrs::array::chunk_grid::ChunkGrid;
use zarrs::array::{ArrayBuilder, DataType, FillValue};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::ReadableWritableListableStorageTraits;

use crate::error::{CompileError, Result};
use crate::slicer::{ChannelStack, StackSink};

pub struct ZarrContainerSink {
    dir: PathBuf,
}

impl ZarrContainerSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CompileError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Container path for one fov.
    pub fn container_path(&self, fov: u32) -> PathBuf {
        self.dir.join(format!("xy{fov:03}.zarr"))
    }

    fn open_store(
        &self,
        fov: u32,
    ) -> Result<Arc<dyn ReadableWritableListableStorageTraits>> {
        let path = self.container_path(fov);
        let store = FilesystemStore::new(&path).map_err(CompileError::container)?;
        let store: Arc<dyn ReadableWritableListableStorageTraits> = Arc::new(store);
        let root = GroupBuilder::new()
            .build(store.clone(), "/")
            .map_err(CompileError::container)?;
        root.store_metadata().map_err(CompileError::container)?;
        Ok(store)
    }
}

impl StackSink for ZarrContainerSink {
    fn write_stack(&mut self, stack: &ChannelStack) -> Result<()> {
        let Some(first) = stack.pages.first() else {
            return Ok(());
        };
        let (rows, cols) = first.dim();
        let store = self.open_store(stack.fov)?;

        let array_path = format!("/channel_{:04}", stack.channel);
        let chunk_grid: ChunkGrid = vec![1, rows as u64, cols as u64]
            .try_into()
            .map_err(CompileError::container)?;
        let array = ArrayBuilder::new(
            vec![stack.pages.len() as u64, rows as u64, cols as u64],
            DataType::UInt16,
            chunk_grid,
            FillValue::from(0u16),
        )
        .build(store.clone(), &array_path)
        .map_err(CompileError::container)?;
        array.store_metadata().map_err(CompileError::container)?;

        for (i, page) in stack.pages.iter().enumerate() {
            let contiguous = page.as_standard_layout();
            let data = contiguous
                .as_slice()
                .ok_or_else(|| CompileError::InvalidGeometry {
                    message: "non-contiguous crop page".to_string(),
                })?;
            array
                .store_chunk_elements::<u16>(&[i as u64, 0, 0], data)
                .map_err(CompileError::container)?;
        }
        debug!(
            "wrote {}{} ({} pages)",
            self.container_path(stack.fov).display(),
            array_path,
            stack.pages.len()
        );
        Ok(())
    }
}
