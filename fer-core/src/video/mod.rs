//! video: FFmpeg bridge
//!
//! Probe a video, decode every frame to RGB, hand it to a per-frame callback
//! that draws on it in place, and encode the result at the source frame rate
//! and size. Audio is not carried over.

use std::path::Path;

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use image::RgbImage;
use tracing::{debug, info, warn};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Bilinear scaling for the decode→encode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// Stream properties of a video file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Container frame count, or a duration × fps estimate; 0 when unknown.
    pub frames: u64,
}

fn rational_to_f64(r: Rational) -> Option<f64> {
    (r.numerator() > 0 && r.denominator() > 0).then(|| r.numerator() as f64 / r.denominator() as f64)
}

/// Best frame rate of a stream: average rate, falling back to the base rate.
fn stream_rate(stream: &format::stream::Stream) -> Option<Rational> {
    [stream.avg_frame_rate(), stream.rate()]
        .into_iter()
        .find(|r| rational_to_f64(*r).is_some())
}

/// Read fps, size and frame count of the best video stream of `path`.
pub fn probe<P: AsRef<Path>>(path: P) -> Result<VideoInfo> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;
    let path = path.as_ref();
    let ictx = format::input(&path)
        .with_context(|| format!("could not open video {}", path.display()))?;
    let stream = ictx
        .streams()
        .best(media::Type::Video)
        .context("no video stream found in input")?;

    let decoder = codec::context::Context::from_parameters(stream.parameters())
        .context("failed to read video stream parameters")?
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    let rate = stream_rate(&stream).context("video stream has no usable frame rate")?;
    let fps = rational_to_f64(rate).unwrap_or(0.0);

    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let frames = if stream.frames() > 0 {
        stream.frames() as u64
    } else {
        let tb = stream.time_base();
        let dur = stream.duration();
        match rational_to_f64(tb) {
            Some(tb) if dur > 0 => (dur as f64 * tb * fps).round() as u64,
            _ => 0,
        }
    };

    Ok(VideoInfo {
        fps,
        width: decoder.width(),
        height: decoder.height(),
        frames,
    })
}

/// Encodes RGB frames into a video file at a fixed frame rate.
///
/// H.264 when the FFmpeg build has it, MPEG-4 Part 2 otherwise. Frames are
/// stamped with consecutive indices in a `1/fps` time base.
pub struct VideoWriter {
    octx: format::context::Output,
    encoder: encoder::Video,
    stream_index: usize,
    time_base: Rational,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    width: u32,
    height: u32,
    codec_name: &'static str,
    frame_count: u64,
}

impl VideoWriter {
    /// Open `path` for `width`×`height` frames at `frame_rate` and write the
    /// container header. The container is chosen from the extension.
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        frame_rate: Rational,
    ) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let path = path.as_ref();
        if rational_to_f64(frame_rate).is_none() {
            anyhow::bail!("invalid frame rate {frame_rate} for {}", path.display());
        }

        let mut octx = format::output(&path)
            .with_context(|| format!("could not create output {}", path.display()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let (encoder_codec, codec_name) = match encoder::find(codec::Id::H264) {
            Some(c) => (c, "H.264"),
            None => {
                warn!("H.264 encoder not found; falling back to MPEG-4 Part 2");
                let c = encoder::find(codec::Id::MPEG4)
                    .context("neither H.264 nor MPEG-4 encoders are available in this FFmpeg build")?;
                (c, "MPEG-4")
            }
        };

        // One tick per frame; frame index doubles as the pts.
        let time_base = frame_rate.invert();

        let mut out_stream = octx.add_stream(encoder_codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;
        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(time_base);
        builder.set_frame_rate(Some(frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }
        let encoder = builder
            .open_as_with(
                encoder_codec,
                ffmpeg::Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
            )
            .with_context(|| format!("failed to open {codec_name} encoder"))?;
        out_stream.set_parameters(&encoder);
        let stream_index = out_stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            ENCODE_FORMAT,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header().context("failed to write output header")?;

        Ok(Self {
            octx,
            encoder,
            stream_index,
            time_base,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            width,
            height,
            codec_name,
            frame_count: 0,
        })
    }

    /// Encode one frame. It must have the size the writer was created with.
    pub fn write(&mut self, image: &RgbImage) -> Result<()> {
        if image.dimensions() != (self.width, self.height) {
            anyhow::bail!(
                "frame is {}x{}, writer expects {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            );
        }

        let row_bytes = self.width as usize * 3;
        let stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        let src = image.as_raw();
        for row in 0..self.height as usize {
            let dst_start = row * stride;
            let src_start = row * row_bytes;
            plane[dst_start..dst_start + row_bytes]
                .copy_from_slice(&src[src_start..src_start + row_bytes]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.frame_count as i64));
        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain()?;

        self.frame_count += 1;
        if self.frame_count % 100 == 0 {
            debug!(frame_count = self.frame_count, "encoded frames");
        }
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frame_count
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain(&mut self) -> Result<()> {
        let out_tb = self
            .octx
            .stream(self.stream_index)
            .context("output video stream vanished")?
            .time_base();
        let mut encoded = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, out_tb);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }

    /// Flush the encoder and write the trailer. Returns the frame count.
    pub fn finish(mut self) -> Result<u64> {
        self.encoder.send_eof().ok();
        self.drain()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(frames = self.frame_count, codec = self.codec_name, "video written");
        Ok(self.frame_count)
    }
}

/// Converts decoded frames of any pixel format into packed `RgbImage`s.
struct RgbConverter {
    scaler: scaling::Context,
    frame: frame::Video,
    width: u32,
    height: u32,
}

impl RgbConverter {
    fn convert(&mut self, decoded: &frame::Video) -> Result<RgbImage> {
        self.scaler
            .run(decoded, &mut self.frame)
            .context("to-RGB scaling failed")?;

        // Compact to a plain buffer (remove stride padding if any)
        let row_bytes = self.width as usize * 3;
        let stride = self.frame.stride(0);
        let raw = self.frame.data(0);
        let mut rgb_data = Vec::with_capacity(row_bytes * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * stride;
            rgb_data.extend_from_slice(&raw[start..start + row_bytes]);
        }
        RgbImage::from_raw(self.width, self.height, rgb_data)
            .context("decoded frame has unexpected size")
    }
}

/// Open `input_path`, call `frame_fn(index, frame)` on every decoded frame
/// (0-based index, draw in place), and write the frames to `output_path` at
/// the source frame rate and size. `progress_fn` receives the number of
/// frames written so far. Returns the number of frames written.
pub fn transcode<P, Q, F, G>(
    input_path: P,
    output_path: Q,
    mut frame_fn: F,
    mut progress_fn: G,
) -> Result<u64>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnMut(u64, &mut RgbImage) -> Result<()>,
    G: FnMut(u64),
{
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    // ── Input ────────────────────────────────────────────────────────────────
    let mut ictx = format::input(&input_path).context("could not open input file")?;

    let input_stream = ictx
        .streams()
        .best(media::Type::Video)
        .context("no video stream found in input")?;
    let video_stream_index = input_stream.index();
    let frame_rate = stream_rate(&input_stream).context("video stream has no usable frame rate")?;

    let decoder_ctx = codec::context::Context::from_parameters(input_stream.parameters())
        .context("failed to build decoder context")?;
    let mut decoder = decoder_ctx
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    let width = decoder.width();
    let height = decoder.height();
    let src_pixel_fmt = decoder.format();
    info!(width, height, ?src_pixel_fmt, "opened input video stream");

    let mut to_rgb = RgbConverter {
        scaler: scaling::Context::get(
            src_pixel_fmt,
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?,
        frame: frame::Video::empty(),
        width,
        height,
    };

    // ── Output ───────────────────────────────────────────────────────────────
    let mut writer = VideoWriter::create(&output_path, width, height, frame_rate)?;

    let mut push = |decoded: &frame::Video, writer: &mut VideoWriter| -> Result<()> {
        let mut image = to_rgb.convert(decoded)?;
        frame_fn(writer.frames_written(), &mut image)?;
        writer.write(&image)?;
        progress_fn(writer.frames_written());
        Ok(())
    };

    // ── Decode / draw / encode loop ─────────────────────────────────────────
    let mut decoded = frame::Video::empty();
    for (stream, packet) in ictx.packets() {
        if stream.index() != video_stream_index {
            continue;
        }
        decoder
            .send_packet(&packet)
            .context("decoder send_packet")?;
        while decoder.receive_frame(&mut decoded).is_ok() {
            push(&decoded, &mut writer)?;
        }
    }

    // Flush decoder
    decoder.send_eof().ok();
    while decoder.receive_frame(&mut decoded).is_ok() {
        push(&decoded, &mut writer)?;
    }

    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_conversion_rejects_empty_rates() {
        assert_eq!(rational_to_f64(Rational::new(30000, 1001)).map(|f| (f * 100.0).round()), Some(2997.0));
        assert_eq!(rational_to_f64(Rational::new(0, 1)), None);
        assert_eq!(rational_to_f64(Rational::new(25, 0)), None);
    }

    fn gradient(width: u32, height: u32, shift: u8) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x as u8).wrapping_add(shift), y as u8, 128])
        })
    }

    #[test]
    fn written_clip_reads_back_and_transcodes() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        let mut writer = VideoWriter::create(&clip, 64, 48, Rational::new(25, 1)).unwrap();
        for i in 0..5 {
            writer.write(&gradient(64, 48, i * 20)).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 5);

        let info = probe(&clip).unwrap();
        assert_eq!((info.width, info.height), (64, 48));
        assert!((info.fps - 25.0).abs() < 1e-6);

        let out = dir.path().join("out.mp4");
        let mut seen = Vec::new();
        let mut progress = Vec::new();
        let frames = transcode(
            &clip,
            &out,
            |index, frame| {
                assert_eq!(frame.dimensions(), (64, 48));
                seen.push(index);
                Ok(())
            },
            |done| progress.push(done),
        )
        .unwrap();
        assert_eq!(frames, 5);
        assert_eq!(seen, [0, 1, 2, 3, 4]);
        assert_eq!(progress, [1, 2, 3, 4, 5]);
        assert_eq!(probe(&out).unwrap().width, 64);
    }

    #[test]
    fn frame_callback_error_stops_transcode() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        let mut writer = VideoWriter::create(&clip, 32, 32, Rational::new(10, 1)).unwrap();
        for i in 0..4 {
            writer.write(&gradient(32, 32, i)).unwrap();
        }
        writer.finish().unwrap();

        let err = transcode(
            &clip,
            dir.path().join("out.mp4"),
            |index, _| if index == 2 { anyhow::bail!("stop at {index}") } else { Ok(()) },
            |_| {},
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "stop at 2");
    }

    #[test]
    fn writer_rejects_mismatched_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            VideoWriter::create(dir.path().join("clip.mp4"), 32, 32, Rational::new(10, 1)).unwrap();
        assert!(writer.write(&RgbImage::new(16, 16)).is_err());
    }

    #[test]
    fn probing_a_non_video_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_video.mp4");
        std::fs::write(&path, b"definitely not a video").unwrap();
        assert!(probe(&path).is_err());
    }
}
