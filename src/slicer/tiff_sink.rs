//! Multi-page TIFF stack sink: one file per (fov, channel).

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use log::debug;
use tiff::encoder::{colortype, TiffEncoder};

use crate::error::{CompileError, Result};
use crate::slicer::{ChannelStack, StackSink};

pub struct TiffStackSink {
    dir: PathBuf,
    experiment: String,
}

impl TiffStackSink {
    pub fn new(dir: impl Into<PathBuf>, experiment: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CompileError::io(&dir, e))?;
        Ok(Self {
            dir,
            experiment: experiment.into(),
        })
    }

    /// Stack file path for one (fov, channel).
    pub fn stack_path(&self, fov: u32, channel: u32) -> PathBuf {
        self.dir
            .join(format!("{}_xy{fov:03}_p{channel:04}.tif", self.experiment))
    }
}

impl StackSink for TiffStackSink {
    fn write_stack(&mut self, stack: &ChannelStack) -> Result<()> {
        let path = self.stack_path(stack.fov, stack.channel);
        let file = File::create(&path).map_err(|e| CompileError::io(&path, e))?;
        let mut encoder =
            TiffEncoder::new(BufWriter::new(file)).map_err(|e| CompileError::TiffWrite {
                path: path.clone(),
                source: e,
            })?;
        for page in &stack.pages {
            let (rows, cols) = page.dim();
            let contiguous = page.as_standard_layout();
            let data = contiguous
                .as_slice()
                .ok_or_else(|| CompileError::InvalidGeometry {
                    message: "non-contiguous crop page".to_string(),
                })?;
            encoder
                .write_image::<colortype::Gray16>(cols as u32, rows as u32, data)
                .map_err(|e| CompileError::TiffWrite {
                    path: path.clone(),
                    source: e,
                })?;
        }
        debug!(
            "wrote {} ({} pages, closed end {:?})",
            path.display(),
            stack.pages.len(),
            stack.closed_end
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClosedEnd;
    use ndarray::Array2;
    use std::io::BufReader;
    use tiff::decoder::{Decoder, DecodingResult};

    #[test]
    fn round_trips_a_multi_page_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TiffStackSink::new(dir.path().join("channels"), "exp").unwrap();
        let pages: Vec<Array2<u16>> = (0..5u16)
            .map(|i| Array2::from_elem((12, 6), 100 + i))
            .collect();
        sink.write_stack(&ChannelStack {
            fov: 1,
            channel: 512,
            closed_end: ClosedEnd::Up,
            timepoints: (0..5).collect(),
            planes_per_frame: 1,
            pages,
        })
        .unwrap();

        let path = sink.stack_path(1, 512);
        assert!(path.ends_with("exp_xy001_p0512.tif"));
        let file = File::open(&path).unwrap();
        let mut decoder = Decoder::new(BufReader::new(file)).unwrap();
        let mut count = 0usize;
        loop {
            match decoder.read_image().unwrap() {
                DecodingResult::U16(data) => {
                    assert_eq!(data.len(), 12 * 6);
                    assert_eq!(data[0], 100 + count as u16);
                }
                _ => panic!("expected 16-bit pages"),
            }
            count += 1;
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().unwrap();
        }
        assert_eq!(count, 5);
    }
}
