//! Binary capture files.
//!
//! All fixed-width fields are little endian.
//!
//! ```text
//! magic        [u8; 8]  "NOCLKCAP"
//! version      u8       1
//! sample_rate  u32
//! channels     u8
//! for each channel:
//!   channel    u8
//!   initial    u8       0 = low, 1 = high
//!   start      u64
//!   edges      varint   number of edges
//!   deltas     varint*  edge[0] - start, then edge[k] - edge[k-1]
//! ```
//!
//! The delta section is the same encoding [`ChannelCapture`] uses in memory, so
//! writing is a straight copy.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;

use crate::{
    capture::{Capture, ChannelCapture},
    cursor::BitState,
    settings::ChannelId,
    varint::{VarintReader, VarintWriter},
};

const MAGIC: [u8; 8] = *b"NOCLKCAP";
const VERSION: u8 = 1;

impl Capture {
    pub fn load(filename: &Path) -> Result<Self> {
        let file = File::open(filename)
            .with_context(|| format!("Opening capture {}", filename.display()))?;
        let capture = read_capture(&mut BufReader::new(file))
            .with_context(|| format!("Reading capture {}", filename.display()))?;
        info!(
            "Loaded {} channels at {} Hz from {}",
            capture.num_channels(),
            capture.sample_rate,
            filename.display()
        );
        Ok(capture)
    }

    pub fn save(&self, filename: &Path) -> Result<()> {
        let file = File::create(filename)
            .with_context(|| format!("Creating capture {}", filename.display()))?;
        let mut writer = BufWriter::new(file);
        write_capture(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

pub fn read_capture(reader: &mut impl Read) -> Result<Capture> {
    let mut magic = [0; 8];
    reader.read_exact(&mut magic).context("Reading magic")?;
    if magic != MAGIC {
        bail!("Not a capture file: {:x?}", magic);
    }

    let version = reader.read_u8()?;
    if version != VERSION {
        bail!("Unsupported capture file version {version} (expected {VERSION})");
    }

    let sample_rate = reader.read_u32::<LittleEndian>()?;
    let num_channels = reader.read_u8()?;

    let mut capture = Capture::new(sample_rate);
    for n in 0..num_channels {
        let (channel, data) =
            read_channel(reader).with_context(|| format!("Reading channel block {n}"))?;
        if capture.channel(channel).is_some() {
            bail!("Channel {channel} appears twice");
        }
        capture.insert(channel, data);
    }
    Ok(capture)
}

fn read_channel(reader: &mut impl Read) -> Result<(ChannelId, ChannelCapture)> {
    let channel = ChannelId(reader.read_u8()? as usize);
    let initial = match reader.read_u8()? {
        0 => BitState::Low,
        1 => BitState::High,
        x => bail!("Invalid initial bit state {x}"),
    };
    let start = reader.read_u64::<LittleEndian>()?;
    let num_edges = reader.read_varint()?;

    let mut data = ChannelCapture::new(initial, start);
    let mut edge = start;
    for i in 0..num_edges {
        let delta = reader
            .read_varint()
            .with_context(|| format!("Reading edge {i} of {num_edges}"))?;
        edge = edge
            .checked_add(delta)
            .with_context(|| format!("Edge {i} overflows the sample counter"))?;
        data.push_edge(edge)?;
    }
    Ok((channel, data))
}

pub fn write_capture(writer: &mut impl Write, capture: &Capture) -> Result<()> {
    let num_channels = u8::try_from(capture.num_channels())
        .context("Too many channels for a capture file")?;

    writer.write_all(&MAGIC)?;
    writer.write_u8(VERSION)?;
    writer.write_u32::<LittleEndian>(capture.sample_rate)?;
    writer.write_u8(num_channels)?;

    for (channel, data) in capture.channels() {
        let id = u8::try_from(channel.0)
            .with_context(|| format!("Channel {channel} does not fit in a capture file"))?;
        writer.write_u8(id)?;
        writer.write_u8(data.initial().is_high() as u8)?;
        writer.write_u64::<LittleEndian>(data.start())?;
        writer.write_varint(data.num_edges())?;
        writer.write_all(data.deltas())?;
    }
    Ok(())
}
