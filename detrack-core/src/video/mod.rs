//! video — FFmpeg bridge
//!
//! `VideoReader` decodes the best video stream of a container into packed
//! RGB24 frames; `VideoWriter` encodes RGB24 frames back into a container as
//! MPEG-4 Part 2 (the `mp4v` fourcc) at the source resolution and frame rate.
//!
//! The pipeline only talks to the `FrameSource` / `FrameSink` traits, so
//! in-memory sources (`VecSource`, `VecSink`) can stand in for files.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, decoder, encoder, format, frame, media, software::scaling, util::rational::Rational,
    Packet,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Error;

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaler flags for the decode and encode conversions.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// Lower bound for the MPEG-4 bitrate so small inputs are not smeared.
const MIN_BIT_RATE: usize = 1_000_000;
/// Bits per pixel per frame used to size the MPEG-4 bitrate.
const BITS_PER_PIXEL: f64 = 0.2;

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Debug, Clone, PartialEq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// A black frame.
    pub fn new(width: u32, height: u32, pts: i64) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * 3],
            width,
            height,
            pts,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}

/// Exact frame rate as a rational `num / den` frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub num: i32,
    pub den: i32,
}

impl FrameRate {
    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }
}

impl From<Rational> for FrameRate {
    fn from(r: Rational) -> Self {
        Self::new(r.numerator(), r.denominator())
    }
}

/// Stream metadata for a frame source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// Approximate number of frames, 0 when unknown (progress reporting only).
    pub total_frames: u64,
}

/// Anything that yields frames in arrival order.
pub trait FrameSource {
    fn info(&self) -> &FrameInfo;

    /// Next frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbFrame>>;
}

/// Anything that accepts annotated frames in order.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<()>;

    /// Flush buffered output and finalise the container. Further writes are
    /// an error; calling `finish` twice is a no-op.
    fn finish(&mut self) -> Result<()>;
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Decodes the best video stream of a container into `RgbFrame`s.
pub struct VideoReader {
    ictx: format::context::Input,
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    decoded: frame::Video,
    rgb: frame::Video,
    info: FrameInfo,
    eof_sent: bool,
    frames_read: u64,
}

impl VideoReader {
    pub fn open<P: AsRef<Path>>(input_path: P) -> Result<Self> {
        let path = input_path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()).into());
        }

        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = format::input(&path).map_err(|e| unavailable(path, e))?;

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| unavailable(path, "no video stream found in input"))?;
        let stream_index = stream.index();
        let frame_rate = select_frame_rate(stream.avg_frame_rate().into(), stream.rate().into());
        let total_frames = estimate_frame_count(&stream, frame_rate);

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| unavailable(path, e))?;

        let width = decoder.width();
        let height = decoder.height();
        let src_pixel_fmt = decoder.format();

        // Scaler: decoded frame → RGB24 (fixed source size)
        let to_rgb = scaling::Context::get(
            src_pixel_fmt,
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        info!(
            path = %path.display(),
            width,
            height,
            fps = frame_rate.as_f64(),
            total_frames,
            ?src_pixel_fmt,
            "opened input video stream"
        );

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            info: FrameInfo {
                width,
                height,
                frame_rate,
                total_frames,
            },
            eof_sent: false,
            frames_read: 0,
        })
    }

    fn convert_decoded(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let width = self.info.width as usize;
        let height = self.info.height as usize;
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let mut data = Vec::with_capacity(width * height * 3);
        for row in 0..height {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + width * 3]);
        }

        let pts = self.decoded.pts().unwrap_or(self.frames_read as i64);
        self.frames_read += 1;

        Ok(RgbFrame {
            data,
            width: self.info.width,
            height: self.info.height,
            pts,
        })
    }
}

impl FrameSource for VideoReader {
    fn info(&self) -> &FrameInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert_decoded().map(Some);
            }
            if self.eof_sent {
                debug!(frames = self.frames_read, "decoder drained");
                return Ok(None);
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("decoder send_packet")?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("decoder send_eof")?;
                    self.eof_sent = true;
                }
                Err(e) => return Err(e).context("failed to read packet"),
            }
        }
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Encodes RGB24 frames as MPEG-4 Part 2 into an output container.
///
/// The container is finalised by [`FrameSink::finish`]; if the writer is
/// dropped before that (early return, error in frame processing) `Drop`
/// finalises it so the output file is still closed and playable.
pub struct VideoWriter {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    out_rgb: frame::Video,
    yuv: frame::Video,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
    finished: bool,
    path: PathBuf,
}

impl VideoWriter {
    /// Create `output_path` with the resolution and frame rate of `info`.
    pub fn create<P: AsRef<Path>>(output_path: P, info: &FrameInfo) -> Result<Self> {
        let path = output_path.as_ref().to_path_buf();
        if !info.frame_rate.is_valid() {
            return Err(Error::Encode(format!(
                "invalid frame rate {}/{}",
                info.frame_rate.num, info.frame_rate.den
            ))
            .into());
        }

        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let mut octx = format::output(&path)
            .with_context(|| format!("could not create output {}", path.display()))?;

        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::MPEG4)
            .context("MPEG-4 encoder not found (FFmpeg built without the native mpeg4 encoder?)")?;

        let frame_rate = Rational::new(info.frame_rate.num, info.frame_rate.den);
        let encoder_time_base = frame_rate.invert();

        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;
        builder.set_width(info.width);
        builder.set_height(info.height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(encoder_time_base);
        builder.set_frame_rate(Some(frame_rate));
        builder.set_bit_rate(bit_rate_for(info));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }
        let encoder = builder
            .open_as(encoder_codec)
            .context("failed to open MPEG-4 encoder")?;

        let stream_index = {
            let mut stream = octx.add_stream(encoder_codec)?;
            stream.set_parameters(&encoder);
            stream.set_time_base(encoder_time_base);
            stream.index()
        };

        octx.write_header()
            .context("failed to write output header")?;

        // The muxer may pick its own stream time base while writing the header.
        let stream_time_base = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .unwrap_or(encoder_time_base);

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            info.width,
            info.height,
            ENCODE_FORMAT,
            info.width,
            info.height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.frame_rate.as_f64(),
            "opened output video stream"
        );

        Ok(Self {
            octx,
            encoder,
            to_yuv,
            out_rgb: frame::Video::new(format::Pixel::RGB24, info.width, info.height),
            yuv: frame::Video::empty(),
            stream_index,
            encoder_time_base,
            stream_time_base,
            width: info.width,
            height: info.height,
            next_pts: 0,
            finished: false,
            path,
        })
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain_encoder(&mut self) -> Result<()> {
        let mut encoded = Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.encoder_time_base, self.stream_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.encoder.send_eof().context("encoder send_eof")?;
        self.drain_encoder()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(path = %self.path.display(), frames = self.next_pts, "output finalised");
        Ok(())
    }
}

impl FrameSink for VideoWriter {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
        if self.finished {
            return Err(Error::Encode("write after finish".into()).into());
        }
        if frame.width != self.width || frame.height != self.height {
            return Err(Error::Encode(format!(
                "frame is {}x{}, output stream is {}x{}",
                frame.width, frame.height, self.width, self.height
            ))
            .into());
        }

        let row_len = self.width as usize * 3;
        let out_stride = self.out_rgb.stride(0);
        let plane = self.out_rgb.data_mut(0);
        for row in 0..self.height as usize {
            let dst = row * out_stride;
            let src = row * row_len;
            plane[dst..dst + row_len].copy_from_slice(&frame.data[src..src + row_len]);
        }

        // Convert RGB24 → YUV420P for encoder
        self.to_yuv
            .run(&self.out_rgb, &mut self.yuv)
            .context("to-YUV scaling failed")?;
        self.yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&self.yuv)
            .context("encoder send_frame")?;
        self.drain_encoder()
    }

    fn finish(&mut self) -> Result<()> {
        self.finalize()
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!(path = %self.path.display(), "failed to finalise output on drop: {e:#}");
        }
    }
}

// ── In-memory frames ──────────────────────────────────────────────────────────

/// Frame source backed by a queue of frames.
pub struct VecSource {
    info: FrameInfo,
    frames: VecDeque<RgbFrame>,
}

impl VecSource {
    pub fn new(frame_rate: FrameRate, frames: Vec<RgbFrame>) -> Self {
        let (width, height) = frames.first().map_or((0, 0), |f| (f.width, f.height));
        Self {
            info: FrameInfo {
                width,
                height,
                frame_rate,
                total_frames: frames.len() as u64,
            },
            frames: frames.into(),
        }
    }
}

impl FrameSource for VecSource {
    fn info(&self) -> &FrameInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
        Ok(self.frames.pop_front())
    }
}

/// Frame sink that keeps every written frame.
#[derive(Default)]
pub struct VecSink {
    pub frames: Vec<RgbFrame>,
    pub finished: bool,
}

impl FrameSink for VecSink {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
        if self.finished {
            return Err(Error::Encode("write after finish".into()).into());
        }
        self.frames.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn unavailable(path: &Path, reason: impl ToString) -> anyhow::Error {
    Error::InputUnavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
    .into()
}

fn bit_rate_for(info: &FrameInfo) -> usize {
    let fps = info.frame_rate.as_f64().max(1.0);
    let bits = info.width as f64 * info.height as f64 * fps * BITS_PER_PIXEL;
    (bits as usize).max(MIN_BIT_RATE)
}

/// The average frame rate when the demuxer knows it, else the stream's base
/// (`r_frame_rate`) rate. Raw elementary streams often only carry the latter.
fn select_frame_rate(average: FrameRate, base: FrameRate) -> FrameRate {
    if average.is_valid() || !base.is_valid() {
        average
    } else {
        base
    }
}

/// Approximate total frame count for a stream (used for progress reporting).
/// Falls back to 0 if the count cannot be determined.
fn estimate_frame_count(stream: &format::stream::Stream<'_>, frame_rate: FrameRate) -> u64 {
    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration(); // in stream time-base units
    let tb = stream.time_base();
    if dur > 0 && tb.denominator() > 0 && frame_rate.is_valid() {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        return (seconds * frame_rate.as_f64()).round() as u64;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_lookup_is_bounds_checked() {
        let mut f = RgbFrame::new(4, 2, 0);
        // (x=3, y=1)
        let i = (4 + 3) * 3;
        f.data[i..i + 3].copy_from_slice(&[1, 2, 3]);
        assert_eq!(f.pixel(3, 1), Some([1, 2, 3]));
        assert_eq!(f.pixel(4, 0), None);
        assert_eq!(f.pixel(0, 2), None);
    }

    #[test]
    fn frame_rate_conversion() {
        assert_eq!(FrameRate::new(30000, 1001).as_f64(), 30000.0 / 1001.0);
        assert_eq!(FrameRate::new(25, 0).as_f64(), 0.0);
        assert!(!FrameRate::new(0, 1).is_valid());
    }

    #[test]
    fn average_rate_wins_unless_unknown() {
        let ntsc = FrameRate::new(30000, 1001);
        let unknown = FrameRate::new(0, 0);
        assert_eq!(select_frame_rate(ntsc, FrameRate::new(60, 1)), ntsc);
        assert_eq!(select_frame_rate(unknown, FrameRate::new(25, 1)), FrameRate::new(25, 1));
        // nothing usable: keep the average so the writer reports it
        assert_eq!(select_frame_rate(unknown, FrameRate::new(0, 1)), unknown);
    }

    #[test]
    fn bit_rate_has_a_floor() {
        let small = FrameInfo {
            width: 64,
            height: 64,
            frame_rate: FrameRate::new(25, 1),
            total_frames: 0,
        };
        assert_eq!(bit_rate_for(&small), MIN_BIT_RATE);

        let hd = FrameInfo {
            width: 1920,
            height: 1080,
            ..small
        };
        assert!(bit_rate_for(&hd) > MIN_BIT_RATE);
    }

    #[test]
    fn vec_source_reports_first_frame_geometry() {
        let frames = vec![RgbFrame::new(8, 6, 0), RgbFrame::new(8, 6, 1)];
        let mut src = VecSource::new(FrameRate::new(10, 1), frames);
        assert_eq!(src.info().width, 8);
        assert_eq!(src.info().height, 6);
        assert_eq!(src.info().total_frames, 2);
        assert_eq!(src.read_frame().unwrap().map(|f| f.pts), Some(0));
        assert_eq!(src.read_frame().unwrap().map(|f| f.pts), Some(1));
        assert!(src.read_frame().unwrap().is_none());
    }

    #[test]
    fn vec_sink_rejects_writes_after_finish() {
        let mut sink = VecSink::default();
        sink.write_frame(&RgbFrame::new(2, 2, 0)).unwrap();
        sink.finish().unwrap();
        assert!(sink.write_frame(&RgbFrame::new(2, 2, 1)).is_err());
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn opening_a_missing_file_fails_fast() {
        let err = VideoReader::open("/no/such/video.mp4").err().unwrap();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::FileNotFound(_))
        ));
    }
}
