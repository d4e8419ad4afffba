//! PSTP 클라이언트 (주변기기를 공유하는 기기)
//!
//! 서버의 기본/보조 경로로 연결하고
//! - 합성 마우스/키 입력을 일정 주기로 전송 (실제 캡처는 플랫폼 계층 담당)
//! - 지정한 파일이나 클립보드 텍스트 전송
//!
//! 사용법:
//!   cargo run --release --bin pstp-client -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin pstp-client -- --server 192.168.1.10 --secret "my pairing code" --file notes.txt

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pstp::{
    ChannelSink, Config, EventPayload, PathCandidate, PathRole, ProtocolKind, TransportSession,
};

/// 클라이언트 설정
struct ClientConfig {
    server_ip: IpAddr,
    secondary_ip: Option<IpAddr>,
    file_path: Option<PathBuf>,
    clipboard: Option<String>,
    input_hz: u64,
    duration: Duration,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_ip: IpAddr::from([127, 0, 0, 1]),
            secondary_ip: None,
            file_path: None,
            clipboard: None,
            input_hz: 125,
            duration: Duration::from_secs(10),
            config: Config::default(),
        }
    }
}

fn parse_args() -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut client = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config" | "-c", Some(path)) => {
                client.config = Config::load(path)?;
                i += 1;
            }
            ("--server" | "-s", Some(ip)) => {
                client.server_ip = ip.parse()?;
                i += 1;
            }
            ("--secondary", Some(ip)) => {
                client.secondary_ip = Some(ip.parse()?);
                i += 1;
            }
            ("--secret", Some(secret)) => {
                client.config.pairing_secret = secret.clone();
                i += 1;
            }
            ("--file" | "-f", Some(path)) => {
                client.file_path = Some(PathBuf::from(path));
                i += 1;
            }
            ("--clipboard", Some(text)) => {
                client.clipboard = Some(text.clone());
                i += 1;
            }
            ("--rate", Some(hz)) => {
                client.input_hz = hz.parse::<u64>()?.max(1);
                i += 1;
            }
            ("--duration" | "-d", Some(secs)) => {
                client.duration = Duration::from_secs(secs.parse()?);
                i += 1;
            }
            ("--help" | "-h", _) => {
                println!(
                    r#"PSTP Client - Peripheral Share Transport Protocol 클라이언트

유선/무선 두 경로로 서버에 연결해 입력, 클립보드/파일을 보낸다.

사용법:
  cargo run --release --bin pstp-client -- [OPTIONS]

옵션:
  -c, --config <PATH>     TOML 설정 파일
  -s, --server <IP>       서버 기본 경로 IP (기본: 127.0.0.1)
  --secondary <IP>        서버 보조 경로 IP (기본: 기본 경로와 같음)
  --secret <TEXT>         페어링 비밀 (필수)
  -f, --file <PATH>       전송할 파일
  --clipboard <TEXT>      전송할 클립보드 텍스트
  --rate <HZ>             합성 입력 주기 (기본: 125)
  -d, --duration <SECS>   입력 전송 시간 (기본: 10)
  -h, --help              이 도움말 출력

로그 수준은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            (other, _) => warn!("알 수 없는 인자 무시: {}", other),
        }
        i += 1;
    }

    Ok(client)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = parse_args()?;
    let config = client.config;

    // 발견 계층 대신 명령줄 주소로 후보 구성
    let candidates = [
        PathCandidate {
            address: SocketAddr::new(client.server_ip, config.primary_port),
            protocol: ProtocolKind::Udp,
            role: PathRole::Primary,
        },
        PathCandidate {
            address: SocketAddr::new(
                client.secondary_ip.unwrap_or(client.server_ip),
                config.secondary_port,
            ),
            protocol: ProtocolKind::Udp,
            role: PathRole::Secondary,
        },
    ];
    let any: SocketAddr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0);

    info!("PSTP Client starting...");
    info!("Device: {}", config.device_name);

    let mut links = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        info!("{:?} 경로: {}", candidate.role, candidate.address);
        links.push(candidate.connect(any).await?);
    }

    // 서버가 보내는 이벤트는 이 데모에서 사용하지 않음
    let (sink, _delivered) = ChannelSink::new();
    let session = TransportSession::connect(config, links, Arc::new(sink)).await?;
    info!(
        "세션 {:016x} 연결, 활성 경로 {:?}",
        session.session_id().unwrap_or_default(),
        session.active_path()
    );

    if let Some(text) = &client.clipboard {
        let id = session.send_clipboard(text.as_bytes()).await?;
        info!("클립보드 전송 {:016x}: {} bytes", id, text.len());
    }

    if let Some(path) = &client.file_path {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file.bin".to_string());
        let id = session.send_file(&name, &data).await?;
        info!("파일 전송 {:016x}: {} ({} bytes)", id, name, data.len());
    }

    // 합성 입력 생산자
    let (tx, rx) = mpsc::channel(256);
    let producer = session.attach_source(rx);
    let period = Duration::from_micros(1_000_000 / client.input_hz);
    let deadline = tokio::time::Instant::now() + client.duration;
    let mut ticker = tokio::time::interval(period);
    let mut report = tokio::time::interval(Duration::from_secs(5));
    let mut step = 0i32;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("종료 요청");
                break;
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => {
                step = step.wrapping_add(1);
                let event = EventPayload::MouseMove {
                    x: (step % 400) - 200,
                    y: ((step / 3) % 400) - 200,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            _ = report.tick() => {
                info!("상태 {:?} | {}", session.state(), session.stats().summary());
                if session.state().is_failed() {
                    break;
                }
            }
        }
    }

    drop(tx);
    let _ = producer.await;
    session.close().await?;
    info!("Final: {}", session.stats().summary());
    Ok(())
}
