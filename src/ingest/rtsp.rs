//! Camera frame producer.
//!
//! `rtsp://` URLs are decoded through GStreamer (feature `rtsp-gstreamer`).
//! `stub://` URLs produce a synthetic walking figure so the daemon runs end to
//! end without a camera.

use anyhow::Result;

use crate::frame::Frame;

use super::FrameProducer;

#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// `rtsp://host/path` or `stub://name`.
    pub url: String,
    pub target_fps: u32,
    /// Scene size for `stub://`; camera streams keep their native size.
    pub width: u32,
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// Producer chosen by URL scheme.
pub enum RtspSource {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Camera(camera::CameraStream),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            return Ok(Self::Synthetic(SyntheticSource::new(config)));
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Self::Camera(camera::CameraStream::open(config)?))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(crate::error::SentinelError::configuration(format!(
                "video source {} needs the rtsp-gstreamer feature",
                config.url
            ))
            .into())
        }
    }

    fn producer(&mut self) -> &mut dyn FrameProducer {
        match self {
            Self::Synthetic(scene) => scene,
            #[cfg(feature = "rtsp-gstreamer")]
            Self::Camera(stream) => stream,
        }
    }

    fn producer_ref(&self) -> &dyn FrameProducer {
        match self {
            Self::Synthetic(scene) => scene,
            #[cfg(feature = "rtsp-gstreamer")]
            Self::Camera(stream) => stream,
        }
    }
}

impl FrameProducer for RtspSource {
    fn connect(&mut self) -> Result<()> {
        self.producer().connect()
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.producer().next_frame()
    }

    fn is_healthy(&self) -> bool {
        self.producer_ref().is_healthy()
    }

    fn describe(&self) -> String {
        self.producer_ref().describe()
    }
}

// -------------------- stub:// scene --------------------

const GROUND: [u8; 3] = [40, 60, 40];
const INTRUDER: [u8; 3] = [235, 220, 200];
const STRIDE_PX: u32 = 4;

/// Flat background with a bright upright block pacing back and forth across
/// the middle third of the frame.
pub struct SyntheticSource {
    config: RtspConfig,
    tick: u64,
    ground: Frame,
}

impl SyntheticSource {
    pub fn new(config: RtspConfig) -> Self {
        let ground = Frame::filled(config.width, config.height, GROUND);
        Self {
            config,
            tick: 0,
            ground,
        }
    }

    /// `(x, y, w, h)` of the figure at tick `n`.
    fn figure_at(&self, n: u64) -> (u32, u32, u32, u32) {
        let (w, h) = (self.config.width, self.config.height);
        let body_w = (w / 10).max(1);
        let body_h = (h / 3).max(1);
        let span = u64::from(w.saturating_sub(body_w).max(1));
        let step = (n * u64::from(STRIDE_PX)) % (2 * span);
        let x = if step < span { step } else { 2 * span - step };
        (x as u32, h / 3, body_w, body_h)
    }

    pub fn frames_produced(&self) -> u64 {
        self.tick
    }
}

impl FrameProducer for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "synthetic scene {} ready ({}x{})",
            self.config.url,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let (x, y, w, h) = self.figure_at(self.tick);
        self.tick += 1;
        let mut frame = Frame::new(
            self.ground.pixels().to_vec(),
            self.config.width,
            self.config.height,
        )?;
        frame.fill_rect(x, y, w, h, INTRUDER);
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}

// -------------------- rtsp:// via GStreamer --------------------

#[cfg(feature = "rtsp-gstreamer")]
mod camera {
    use std::time::{Duration, Instant};

    use anyhow::{anyhow, Context, Result};
    use gstreamer::prelude::*;

    use crate::frame::Frame;
    use crate::ingest::FrameProducer;

    use super::RtspConfig;

    const MIN_PULL_WAIT: Duration = Duration::from_millis(500);
    const MIN_STALE_AFTER: Duration = Duration::from_secs(2);
    const FIRST_FRAME_GRACE: Duration = Duration::from_secs(5);

    /// `rtspsrc ! decodebin ! videoconvert ! appsink`, keeping only the newest
    /// decoded RGB buffer.
    pub struct CameraStream {
        url: String,
        frame_period: Duration,
        pipeline: gstreamer::Pipeline,
        sink: gstreamer_app::AppSink,
        opened_at: Option<Instant>,
        last_frame: Option<Instant>,
        fault: Option<String>,
    }

    impl CameraStream {
        pub fn open(config: RtspConfig) -> Result<Self> {
            gstreamer::init().context("gstreamer init failed")?;

            let launch = format!(
                "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! \
                 video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=1 drop=true",
                config.url
            );
            let pipeline = gstreamer::parse::launch(&launch)
                .with_context(|| format!("could not build pipeline for {}", config.url))?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| anyhow!("launch string did not produce a pipeline"))?;
            let sink = pipeline
                .by_name("sink")
                .context("pipeline has no appsink")?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| anyhow!("sink element is not an appsink"))?;

            let fps = config.target_fps.max(1);
            Ok(Self {
                url: config.url,
                frame_period: Duration::from_secs(1) / fps,
                pipeline,
                sink,
                opened_at: None,
                last_frame: None,
                fault: None,
            })
        }

        fn drain_bus(&mut self) {
            let Some(bus) = self.pipeline.bus() else {
                return;
            };
            while let Some(msg) = bus.pop() {
                match msg.view() {
                    gstreamer::MessageView::Error(err) => {
                        self.fault = Some(format!("stream error: {}", err.error()));
                    }
                    gstreamer::MessageView::Eos(..) => {
                        self.fault = Some("stream ended".to_string());
                    }
                    _ => {}
                }
            }
        }
    }

    impl FrameProducer for CameraStream {
        fn connect(&mut self) -> Result<()> {
            self.pipeline
                .set_state(gstreamer::State::Playing)
                .with_context(|| format!("could not start {}", self.url))?;
            self.opened_at = Some(Instant::now());
            self.fault = None;
            log::info!("camera stream {} playing", self.url);
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame> {
            self.drain_bus();
            if let Some(fault) = &self.fault {
                return Err(anyhow!("{}: {}", self.url, fault));
            }

            let wait = (self.frame_period * 4).max(MIN_PULL_WAIT);
            let sample = self
                .sink
                .try_pull_sample(gstreamer::ClockTime::from_mseconds(wait.as_millis() as u64))
                .ok_or_else(|| anyhow!("{}: no frame within {:?}", self.url, wait))?;
            let frame = rgb_frame(&sample)?;
            self.last_frame = Some(Instant::now());
            Ok(frame)
        }

        fn is_healthy(&self) -> bool {
            if self.fault.is_some() {
                return false;
            }
            match (self.opened_at, self.last_frame) {
                (None, _) => false,
                (Some(opened), None) => opened.elapsed() <= FIRST_FRAME_GRACE,
                (Some(_), Some(last)) => {
                    last.elapsed() <= (self.frame_period * 6).max(MIN_STALE_AFTER)
                }
            }
        }

        fn describe(&self) -> String {
            self.url.clone()
        }
    }

    impl Drop for CameraStream {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
        }
    }

    /// Copy a sample into a tightly packed RGB frame, dropping row padding.
    fn rgb_frame(sample: &gstreamer::Sample) -> Result<Frame> {
        let caps = sample.caps().context("sample without caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps).context("caps are not raw video")?;
        let buffer = sample.buffer().context("sample without buffer")?;
        let map = buffer.map_readable().context("buffer not readable")?;

        let (width, height) = (info.width(), info.height());
        let packed = width as usize * 3;
        let stride = info.stride()[0] as usize;
        let data = map.as_slice();

        let pixels = if stride == packed {
            data.to_vec()
        } else {
            let mut pixels = Vec::with_capacity(packed * height as usize);
            for row in data.chunks(stride).take(height as usize) {
                pixels.extend_from_slice(row.get(..packed).context("short row in buffer")?);
            }
            pixels
        };
        Frame::new(pixels, width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, MotionBackend, Thresholds};

    fn stub_config() -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            target_fps: 10,
            width: 160,
            height: 120,
        }
    }

    #[test]
    fn stub_url_yields_frames_of_configured_size() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.connect()?;

        let frame = source.next_frame()?;
        assert_eq!((frame.width(), frame.height()), (160, 120));
        assert!(source.is_healthy());
        assert_eq!(source.describe(), "stub://test");
        Ok(())
    }

    #[test]
    fn camera_url_without_gstreamer_is_a_configuration_error() {
        let config = RtspConfig {
            url: "rtsp://10.0.0.1/stream".to_string(),
            ..stub_config()
        };
        if cfg!(not(feature = "rtsp-gstreamer")) {
            let err = RtspSource::new(config).err().unwrap();
            assert!(crate::SentinelError::is_configuration(&err));
        }
    }

    #[test]
    fn figure_paces_and_turns_back() {
        let scene = SyntheticSource::new(stub_config());
        let (x0, y0, w, _) = scene.figure_at(0);
        let (x1, y1, _, _) = scene.figure_at(1);
        assert_eq!((x0, y0), (0, 40));
        assert_eq!((x1, y1), (STRIDE_PX, y0));

        let span = u64::from(160 - w);
        let (x_far, _, _, _) = scene.figure_at(span / u64::from(STRIDE_PX));
        assert_eq!(u64::from(x_far), span);
        let (x_back, _, _, _) = scene.figure_at(2 * span / u64::from(STRIDE_PX));
        assert_eq!(x_back, 0);
    }

    #[test]
    fn motion_backend_sees_the_figure() -> Result<()> {
        let mut scene = SyntheticSource::new(stub_config());
        let mut backend = MotionBackend::new();
        let thresholds = Thresholds::default();

        backend.detect(&scene.next_frame()?, &thresholds)?;
        let dets = backend.detect(&scene.next_frame()?, &thresholds)?;
        assert_eq!(dets.len(), 1);
        assert!(dets[0].bbox.y1 >= 40 && dets[0].bbox.y2 < 80);
        assert_eq!(scene.frames_produced(), 2);
        Ok(())
    }
}
