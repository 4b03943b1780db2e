//! Cache file persistence.
//!
//! A cache file is a flat run of fixed-size records, each a [`NodeId`]
//! followed by one [`Block`], in native byte order. There is no header or
//! trailer; end of stream ends the tree. Records are written in pre-order so
//! a reader rebuilds nodes parent-first, but any order loads to the same tree.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::block::{Block, FINAL_PASS};
use crate::error::CacheResult;
use crate::node_id::{NodeId, MAX_EXTENT};
use crate::octree::Octree;

/// On-disk layout of one (NodeId, Block) pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlockRecord {
    x: i64,
    y: i64,
    z: i64,
    size: u64,
    position: [f32; 3],
    normal: [f32; 3],
    to_nearest_surface: [f32; 3],
    irradiance: [f32; 3],
    gradients: [[f32; 3]; 3],
    nearest_distance: f32,
    harmonic_mean_distance: f32,
    quality: f32,
    tile_id: u32,
    pass: u32,
    bounce_depth: u32,
    reserved: u32,
}

/// Size in bytes of one record.
pub const RECORD_SIZE: usize = std::mem::size_of::<BlockRecord>();

impl BlockRecord {
    fn new(id: NodeId, block: &Block) -> Self {
        Self {
            x: id.x,
            y: id.y,
            z: id.z,
            size: id.size,
            position: block.position.to_array(),
            normal: block.normal.to_array(),
            to_nearest_surface: block.to_nearest_surface.to_array(),
            irradiance: block.irradiance.to_array(),
            gradients: block.gradients.map(|g| g.to_array()),
            nearest_distance: block.nearest_distance,
            harmonic_mean_distance: block.harmonic_mean_distance,
            quality: block.quality,
            tile_id: block.tile_id,
            pass: block.pass,
            bounce_depth: block.bounce_depth,
            reserved: 0,
        }
    }

    fn id(&self) -> NodeId {
        NodeId {
            x: self.x,
            y: self.y,
            z: self.z,
            size: self.size,
        }
    }

    fn block(&self) -> Block {
        Block {
            position: Vec3::from_array(self.position),
            normal: Vec3::from_array(self.normal),
            to_nearest_surface: Vec3::from_array(self.to_nearest_surface),
            irradiance: Vec3::from_array(self.irradiance),
            gradients: self.gradients.map(Vec3::from_array),
            nearest_distance: self.nearest_distance,
            harmonic_mean_distance: self.harmonic_mean_distance,
            quality: self.quality,
            tile_id: self.tile_id,
            pass: self.pass,
            bounce_depth: self.bounce_depth,
        }
    }

    /// Reason this record cannot be trusted, if any.
    fn defect(&self) -> Option<&'static str> {
        let id = self.id();
        if !id.size.is_power_of_two() {
            return Some("node size is not a power of two");
        }
        if !id.is_valid() {
            return Some("node id outside the biased range");
        }
        let block = self.block();
        let finite = block.position.is_finite()
            && block.normal.is_finite()
            && block.irradiance.is_finite()
            && block.to_nearest_surface.is_finite()
            && block.gradients.iter().all(|g| g.is_finite());
        if !finite {
            return Some("non-finite sample data");
        }
        if block.position.abs().max_element() >= MAX_EXTENT {
            return Some("sample position outside the cacheable range");
        }
        if !(block.harmonic_mean_distance > 0.0) || !block.quality.is_finite() {
            return Some("invalid sample distances");
        }
        if !id.contains(&NodeId::from_point(block.position, 0.0)) {
            return Some("sample position outside its node");
        }
        None
    }
}

/// Options applied while reading a cache file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadParams {
    /// Re-address every sample with this error bound instead of trusting the
    /// stored node id.
    pub error_bound: Option<f32>,
    /// Pass number that marks final-quality samples.
    pub final_pass: u32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            error_bound: None,
            final_pass: FINAL_PASS,
        }
    }
}

/// Summary of a cache file read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadInfo {
    /// Records loaded into the tree
    pub records: usize,
    /// Records dropped because of damage (the rest of the file is skipped)
    pub rejected: usize,
    /// Sum of sample luminance
    pub brightness_sum: f64,
    /// True if any sample was taken during a pretrace pass
    pub found_non_final_samples: bool,
    /// True if the file was damaged and only a prefix was loaded
    pub untrusted: bool,
}

impl ReadInfo {
    pub fn average_brightness(&self) -> f64 {
        if self.records == 0 {
            0.0
        } else {
            self.brightness_sum / self.records as f64
        }
    }
}

/// Write every block of `octree`; returns the number of records written.
pub fn save<W: Write>(octree: &Octree, mut writer: W) -> CacheResult<usize> {
    let mut written = 0;
    for (id, block) in octree.iter() {
        writer.write_all(bytemuck::bytes_of(&BlockRecord::new(id, block)))?;
        written += 1;
    }
    writer.flush()?;
    log::debug!("Saved {} cache records", written);
    Ok(written)
}

enum Fill {
    Full,
    Eof,
    Partial(usize),
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 => Fill::Eof,
        n if n == buf.len() => Fill::Full,
        n => Fill::Partial(n),
    })
}

/// Read a cache file into a new tree.
///
/// Damage never fails the load: the first bad record and everything after it
/// are discarded, a warning is logged and the result is flagged untrusted.
pub fn load<R: Read>(mut reader: R, params: &LoadParams) -> CacheResult<(Octree, ReadInfo)> {
    let mut octree = Octree::new();
    let mut info = ReadInfo::default();
    let mut buf = [0u8; RECORD_SIZE];

    loop {
        match fill(&mut reader, &mut buf) {
            Ok(Fill::Full) => {}
            Ok(Fill::Eof) => break,
            Ok(Fill::Partial(n)) => {
                log::warn!(
                    "Cache record {} truncated ({} of {} bytes); ignoring the rest of the file",
                    info.records,
                    n,
                    RECORD_SIZE
                );
                info.rejected += 1;
                info.untrusted = true;
                break;
            }
            Err(e) => {
                log::warn!("Cache read failed after {} records: {}", info.records, e);
                info.untrusted = true;
                break;
            }
        }

        let record: BlockRecord = bytemuck::pod_read_unaligned(&buf);
        if let Some(reason) = record.defect() {
            log::warn!(
                "Cache record {} rejected: {}; ignoring the rest of the file",
                info.records,
                reason
            );
            info.rejected += 1;
            info.untrusted = true;
            break;
        }

        let block = record.block();
        let id = match params.error_bound {
            Some(bound) => NodeId::for_sphere(block.position, block.reuse_radius(bound))?,
            None => record.id(),
        };
        octree.insert(block, id)?;

        info.records += 1;
        info.brightness_sum += block.luminance() as f64;
        if block.pass != params.final_pass {
            info.found_non_final_samples = true;
        }
    }

    log::info!(
        "Loaded {} cache records (average brightness {:.4}{})",
        info.records,
        info.average_brightness(),
        if info.untrusted { ", untrusted" } else { "" }
    );
    Ok((octree, info))
}

/// Save to a file, replacing it.
pub fn save_to_path(octree: &Octree, path: impl AsRef<Path>) -> CacheResult<usize> {
    let file = File::create(path.as_ref())?;
    save(octree, BufWriter::new(file))
}

/// Load from a file. A missing file is an error; a damaged one is not.
pub fn load_from_path(path: impl AsRef<Path>, params: &LoadParams) -> CacheResult<(Octree, ReadInfo)> {
    let file = File::open(path.as_ref())?;
    load(BufReader::new(file), params)
}
