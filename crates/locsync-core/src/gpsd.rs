//! Location provider backed by a gpsd daemon.
//!
//! gpsd speaks newline-delimited JSON over TCP. After connecting, the
//! provider enables watch mode and turns every `TPV` report carrying a 2D or
//! 3D fix into a [`LocationSample`]. A renewal request is answered with
//! `?POLL;`, whose response embeds the latest `TPV` reports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use locsync_types::{Authorization, Availability, LocationSample, Position};

use crate::error::{Error, Result};
use crate::traits::LocationProvider;

/// Default gpsd address.
pub const DEFAULT_GPSD_ADDRESS: &str = "127.0.0.1:2947";

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";
const POLL_COMMAND: &[u8] = b"?POLL;\n";

/// Options for [`GpsdProvider`].
#[derive(Debug, Clone)]
pub struct GpsdOptions {
    /// `host:port` of the gpsd daemon.
    pub address: String,
    /// Timeout for connecting to the daemon.
    pub connect_timeout: Duration,
    /// Delay before reconnecting after the daemon closed the connection.
    pub reconnect_delay: Duration,
    /// Authorization reported to the controller.
    ///
    /// gpsd has no permission model, so this is taken from configuration.
    pub authorization: Authorization,
}

impl Default for GpsdOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_GPSD_ADDRESS.to_string(),
            connect_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(5),
            authorization: Authorization::Authorized,
        }
    }
}

struct Watch {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A [`LocationProvider`] reading fixes from gpsd.
pub struct GpsdProvider {
    options: GpsdOptions,
    poll: Arc<Notify>,
    watch: Mutex<Option<Watch>>,
}

impl std::fmt::Debug for GpsdProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpsdProvider")
            .field("address", &self.options.address)
            .finish()
    }
}

impl GpsdProvider {
    /// Create a provider with the given options.
    pub fn new(options: GpsdOptions) -> Self {
        Self {
            options,
            poll: Arc::new(Notify::new()),
            watch: Mutex::new(None),
        }
    }

    /// The configured daemon address.
    pub fn address(&self) -> &str {
        &self.options.address
    }

    async fn connect(options: &GpsdOptions) -> Result<TcpStream> {
        let stream = tokio::time::timeout(
            options.connect_timeout,
            TcpStream::connect(&options.address),
        )
        .await
        .map_err(|_| {
            Error::Provider(format!(
                "connecting to gpsd at {} timed out",
                options.address
            ))
        })??;
        Ok(stream)
    }
}

#[async_trait]
impl LocationProvider for GpsdProvider {
    fn name(&self) -> &str {
        "gpsd"
    }

    async fn availability(&self) -> Availability {
        match Self::connect(&self.options).await {
            Ok(_) => Availability::Enabled,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!("gpsd refused connection at {}", self.options.address);
                Availability::Unsupported
            }
            Err(e) => {
                debug!("gpsd unreachable: {}", e);
                Availability::Disabled
            }
        }
    }

    async fn authorization(&self) -> Authorization {
        self.options.authorization
    }

    async fn start_updates(&self, sink: mpsc::Sender<LocationSample>) -> Result<()> {
        let stream = Self::connect(&self.options).await?;

        let mut watch = self.watch.lock().await;
        if let Some(previous) = watch.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_watch(
            self.options.clone(),
            stream,
            sink,
            Arc::clone(&self.poll),
            cancel.clone(),
        ));
        *watch = Some(Watch { cancel, task });

        info!("Watching gpsd at {}", self.options.address);
        Ok(())
    }

    async fn stop_updates(&self) -> Result<()> {
        if let Some(watch) = self.watch.lock().await.take() {
            watch.cancel.cancel();
            if let Err(e) = watch.task.await {
                warn!("gpsd watch task ended abnormally: {}", e);
            }
            info!("Stopped watching gpsd");
        }
        Ok(())
    }

    async fn request_fix(&self) -> Result<()> {
        self.poll.notify_one();
        Ok(())
    }
}

async fn run_watch(
    options: GpsdOptions,
    mut stream: TcpStream,
    sink: mpsc::Sender<LocationSample>,
    poll: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        match watch_connection(&mut stream, &sink, &poll, &cancel).await {
            Ok(WatchEnd::Cancelled) => return,
            Ok(WatchEnd::ReceiverClosed) => {
                debug!("Sample receiver closed, leaving gpsd watch");
                return;
            }
            Ok(WatchEnd::Disconnected) => warn!("gpsd closed the connection"),
            Err(e) => warn!("gpsd watch failed: {}", e),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(options.reconnect_delay) => {}
            }
            match GpsdProvider::connect(&options).await {
                Ok(new_stream) => {
                    info!("Reconnected to gpsd at {}", options.address);
                    stream = new_stream;
                    break;
                }
                Err(e) => debug!("gpsd reconnect failed: {}", e),
            }
        }
    }
}

enum WatchEnd {
    Cancelled,
    ReceiverClosed,
    Disconnected,
}

async fn watch_connection(
    stream: &mut TcpStream,
    sink: &mpsc::Sender<LocationSample>,
    poll: &Notify,
    cancel: &CancellationToken,
) -> Result<WatchEnd> {
    let (reader, mut writer) = stream.split();
    writer.write_all(WATCH_COMMAND).await?;

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(WatchEnd::Cancelled),
            _ = poll.notified() => {
                writer.write_all(POLL_COMMAND).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(WatchEnd::Disconnected);
                };
                for sample in parse_report(&line) {
                    if sink.send(sample).await.is_err() {
                        return Ok(WatchEnd::ReceiverClosed);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "class")]
enum Report {
    #[serde(rename = "TPV")]
    Tpv(Tpv),
    #[serde(rename = "POLL")]
    Poll {
        #[serde(default)]
        tpv: Vec<Tpv>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Tpv {
    #[serde(default)]
    mode: u8,
    time: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
}

impl Tpv {
    fn to_sample(&self) -> Option<LocationSample> {
        // mode 2 = 2D fix, 3 = 3D fix
        if self.mode < 2 {
            return None;
        }
        let timestamp = OffsetDateTime::parse(self.time.as_deref()?, &Rfc3339).ok()?;
        let position = Position::checked(self.lat?, self.lon?)
            .map_err(|e| debug!("Dropping gpsd fix: {}", e))
            .ok()?;
        let sample = LocationSample::new(position.latitude, position.longitude, timestamp);

        let accuracy = self.eph.or(match (self.epx, self.epy) {
            (Some(x), Some(y)) => Some(x.max(y)),
            _ => None,
        });
        Some(match accuracy {
            Some(accuracy) => sample.with_accuracy(accuracy),
            None => sample,
        })
    }
}

/// Parse one line of gpsd output into the samples it carries.
///
/// Lines that are not `TPV` or `POLL` reports, or that carry no usable fix,
/// produce no samples.
pub fn parse_report(line: &str) -> Vec<LocationSample> {
    match serde_json::from_str::<Report>(line) {
        Ok(Report::Tpv(tpv)) => tpv.to_sample().into_iter().collect(),
        Ok(Report::Poll { tpv }) => tpv.iter().filter_map(Tpv::to_sample).collect(),
        Ok(Report::Other) => Vec::new(),
        Err(e) => {
            debug!("Ignoring unparseable gpsd line: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TPV_3D: &str = r#"{"class":"TPV","device":"/dev/ttyACM0","mode":3,"time":"2023-11-14T22:13:20.250Z","lat":43.0731,"lon":-89.4012,"alt":270.1,"eph":4.5}"#;

    #[test]
    fn test_parse_tpv_fix() {
        let samples = parse_report(TPV_3D);
        assert_eq!(samples.len(), 1);
        let sample = samples[0];
        assert_eq!(sample.latitude, 43.0731);
        assert_eq!(sample.longitude, -89.4012);
        assert_eq!(sample.accuracy, Some(4.5));
        assert_eq!(sample.timestamp.unix_timestamp(), 1_700_000_000);
        assert_eq!(sample.timestamp.millisecond(), 250);
    }

    #[test]
    fn test_parse_tpv_without_fix() {
        let line = r#"{"class":"TPV","mode":1,"time":"2023-11-14T22:13:20Z"}"#;
        assert!(parse_report(line).is_empty());

        let line = r#"{"class":"TPV","mode":2,"lat":1.0,"lon":2.0}"#;
        assert!(parse_report(line).is_empty());
    }

    #[test]
    fn test_parse_tpv_out_of_range() {
        let line = r#"{"class":"TPV","mode":3,"time":"2023-11-14T22:13:20Z","lat":95.0,"lon":2.0}"#;
        assert!(parse_report(line).is_empty());

        let line = r#"{"class":"TPV","mode":3,"time":"2023-11-14T22:13:20Z","lat":1.0,"lon":-181.0}"#;
        assert!(parse_report(line).is_empty());
    }

    #[test]
    fn test_parse_epx_epy_accuracy() {
        let line = r#"{"class":"TPV","mode":2,"time":"2023-11-14T22:13:20Z","lat":1.0,"lon":2.0,"epx":3.0,"epy":7.0}"#;
        assert_eq!(parse_report(line)[0].accuracy, Some(7.0));
    }

    #[test]
    fn test_parse_poll() {
        let line = format!(r#"{{"class":"POLL","time":"2023-11-14T22:13:21Z","active":1,"tpv":[{TPV_3D}],"sky":[]}}"#);
        assert_eq!(parse_report(&line).len(), 1);
    }

    #[test]
    fn test_parse_other_classes() {
        assert!(parse_report(r#"{"class":"VERSION","release":"3.25"}"#).is_empty());
        assert!(parse_report(r#"{"class":"SKY","satellites":[]}"#).is_empty());
        assert!(parse_report("not json").is_empty());
    }

    #[tokio::test]
    async fn test_streams_samples_from_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (reader, mut writer) = socket.split();
                    let mut lines = BufReader::new(reader).lines();
                    // Availability probes disconnect without sending anything
                    let Ok(Some(watch)) = lines.next_line().await else {
                        return;
                    };
                    assert!(watch.starts_with("?WATCH="));
                    writer
                        .write_all(b"{\"class\":\"VERSION\",\"release\":\"3.25\"}\n")
                        .await
                        .unwrap();
                    writer.write_all(TPV_3D.as_bytes()).await.unwrap();
                    writer.write_all(b"\n").await.unwrap();
                    let _ = lines.next_line().await;
                });
            }
        });

        let provider = GpsdProvider::new(GpsdOptions {
            address,
            ..GpsdOptions::default()
        });
        assert_eq!(provider.availability().await, Availability::Enabled);

        let (tx, mut rx) = mpsc::channel(4);
        provider.start_updates(tx).await.unwrap();

        let sample = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.latitude, 43.0731);

        provider.stop_updates().await.unwrap();
    }
}
