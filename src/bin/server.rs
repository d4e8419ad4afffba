//! PSTP 서버 (공유받는 기기)
//!
//! 기본/보조 경로 두 UDP 포트에서 연결을 기다리고
//! - 입력 이벤트는 로그로 출력 (실제 주입은 플랫폼 계층 담당)
//! - 클립보드/파일 전송은 재조립해서 출력 디렉터리에 저장
//!
//! 사용법:
//!   cargo run --release --bin pstp-server -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin pstp-server -- --secret "my pairing code" --output ./received

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pstp::{
    ChannelSink, Config, DeliveredEvents, PathLink, PathRole, TransferKind, TransferReassembler,
    TransportSession,
};

/// 서버 설정
struct ServerConfig {
    bind_ip: IpAddr,
    output_dir: PathBuf,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            output_dir: PathBuf::from("."),
            config: Config::default(),
        }
    }
}

fn parse_args() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut server = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config" | "-c", Some(path)) => {
                server.config = Config::load(path)?;
                i += 1;
            }
            ("--bind" | "-b", Some(ip)) => {
                server.bind_ip = ip.parse()?;
                i += 1;
            }
            ("--secret" | "-s", Some(secret)) => {
                server.config.pairing_secret = secret.clone();
                i += 1;
            }
            ("--output" | "-o", Some(dir)) => {
                server.output_dir = PathBuf::from(dir);
                i += 1;
            }
            ("--primary-port", Some(port)) => {
                server.config.primary_port = port.parse()?;
                i += 1;
            }
            ("--secondary-port", Some(port)) => {
                server.config.secondary_port = port.parse()?;
                i += 1;
            }
            ("--help" | "-h", _) => {
                println!(
                    r#"PSTP Server - Peripheral Share Transport Protocol 서버

유선/무선 두 경로로 입력, 클립보드/파일, 오디오를 받는다.

사용법:
  cargo run --release --bin pstp-server -- [OPTIONS]

옵션:
  -c, --config <PATH>       TOML 설정 파일
  -b, --bind <IP>           바인드 IP (기본: 0.0.0.0)
  -s, --secret <TEXT>       페어링 비밀 (필수)
  -o, --output <DIR>        수신 파일 저장 디렉터리 (기본: .)
  --primary-port <PORT>     기본 경로 포트 (기본: 8888)
  --secondary-port <PORT>   보조 경로 포트 (기본: 8889)
  -h, --help                이 도움말 출력

로그 수준은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            (other, _) => warn!("알 수 없는 인자 무시: {}", other),
        }
        i += 1;
    }

    Ok(server)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = parse_args()?;
    let config = server.config;
    std::fs::create_dir_all(&server.output_dir)?;

    info!("PSTP Server starting...");
    info!("Device: {}", config.device_name);
    info!(
        "Primary: {}:{} / Secondary: {}:{}",
        server.bind_ip, config.primary_port, server.bind_ip, config.secondary_port
    );

    let links = vec![
        PathLink::udp_bind(
            PathRole::Primary,
            SocketAddr::new(server.bind_ip, config.primary_port),
        )
        .await?,
        PathLink::udp_bind(
            PathRole::Secondary,
            SocketAddr::new(server.bind_ip, config.secondary_port),
        )
        .await?,
    ];

    let max_transfer_size = config.max_transfer_size;
    let (sink, delivered) = ChannelSink::new();
    let session = TransportSession::accept(config, links, Arc::new(sink)).await?;
    info!(
        "세션 {:016x} 수립, 활성 경로 {:?}",
        session.session_id().unwrap_or_default(),
        session.active_path()
    );

    let DeliveredEvents {
        mut input,
        mut transfer,
        mut audio,
    } = delivered;

    // 입력 이벤트
    let input_task = tokio::spawn(async move {
        while let Some(event) = input.recv().await {
            debug!("input #{}: {:?}", event.sequence(), event.payload());
        }
    });

    // 오디오 프레임 (재생은 플랫폼 계층 담당)
    let audio_task = tokio::spawn(async move {
        let mut frames = 0u64;
        while let Some(event) = audio.recv().await {
            frames += 1;
            if frames % 500 == 0 {
                info!("audio frames: {} (latest #{})", frames, event.sequence());
            }
        }
    });

    // 전송 재조립
    let output_dir = server.output_dir.clone();
    let transfer_task = tokio::spawn(async move {
        let mut reassembler = TransferReassembler::new(max_transfer_size);
        while let Some(event) = transfer.recv().await {
            match reassembler.accept(event.payload()) {
                Ok(Some(done)) => match done.kind {
                    TransferKind::Clipboard => {
                        info!("클립보드 수신: {} bytes", done.data.len());
                    }
                    TransferKind::File => match done.write_to(&output_dir) {
                        Ok(path) => info!("파일 저장: {:?} ({} bytes)", path, done.data.len()),
                        Err(e) => warn!("파일 저장 실패: {}", e),
                    },
                },
                Ok(None) => {}
                Err(e) => warn!("전송 조각 거부: {}", e),
            }
        }
    });

    let mut state = session.subscribe_state();
    let mut report = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("종료 요청");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!("세션 상태: {:?}", current);
                if current.is_failed() {
                    break;
                }
            }
            _ = report.tick() => {
                info!("{}", session.stats().summary());
            }
        }
    }

    session.close().await?;
    info!("Final: {}", session.stats().summary());

    input_task.abort();
    audio_task.abort();
    transfer_task.abort();
    Ok(())
}
