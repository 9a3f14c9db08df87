//! SMCast 노드 - 멀티캐스트 그룹 참여자
//!
//! 표준 입력의 각 줄을 신뢰성 패킷으로 보내고, 받은 패킷과 세션 이벤트를 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin smcast-node -- [OPTIONS]
//!
//! 예시:
//!   # 같은 LAN의 두 터미널에서
//!   cargo run --release --bin smcast-node -- --group 239.1.2.3 --port 5500 --ttl 15
//!
//!   # 고정 전송률 1 Mbit/s
//!   RUST_LOG=smcast=debug cargo run --release --bin smcast-node -- --min-rate 1000 --max-rate 1000

use std::net::Ipv4Addr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use smcast::{Config, Reliability, Session, SessionEvent, Throughput, UdpTransport};

/// 노드 설정
struct NodeConfig {
    group: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
    stats_interval: Option<Duration>,
    config: Config,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 10, 1),
            port: 5500,
            interface: Ipv4Addr::UNSPECIFIED,
            stats_interval: None,
            config: Config::default(),
        }
    }
}

fn value<T: std::str::FromStr>(args: &[String], i: usize, what: &str) -> T {
    match args.get(i + 1).map(|s| s.parse()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("{} 옵션에 유효한 {} 필요", args[i], what);
            process::exit(2);
        }
    }
}

fn parse_args() -> NodeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut node = NodeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--group" | "-g" => {
                node.group = value(&args, i, "IPv4 주소");
                i += 1;
            }
            "--port" | "-p" => {
                node.port = value(&args, i, "포트");
                i += 1;
            }
            "--ttl" | "-t" => {
                node.config.ttl = value(&args, i, "TTL");
                i += 1;
            }
            "--interface" | "-i" => {
                node.interface = value(&args, i, "IPv4 주소");
                i += 1;
            }
            "--min-rate" => {
                node.config.min_rate_kbps = value(&args, i, "숫자");
                i += 1;
            }
            "--max-rate" => {
                node.config.max_rate_kbps = value(&args, i, "숫자");
                i += 1;
            }
            "--window" | "-w" => {
                let size: usize = value(&args, i, "숫자");
                node.config.send_window_size = size;
                node.config.rcv_window_size = size;
                i += 1;
            }
            "--best-effort" => {
                node.config.throughput = Throughput::BestEffort;
            }
            "--constant" => {
                node.config.throughput = Throughput::Constant;
            }
            "--loss-allowed" => {
                node.config.reliability = Reliability::LossAllowed;
            }
            "--limited-loss" => {
                node.config.reliability = Reliability::LimitedLoss;
            }
            "--no-repair" => {
                node.config.send_repair = false;
            }
            "--stats" => {
                let secs: u64 = value(&args, i, "초");
                node.stats_interval = Some(Duration::from_secs(secs.max(1)));
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"SMCast Node - Scoped Multicast 참여자

NACK 기반 신뢰성 멀티캐스트 + TTL 도메인 지역 복구
- 표준 입력의 각 줄을 그룹에 신뢰성 패킷으로 송신
- 받은 패킷과 복구 불가 손실/소스 종료 이벤트를 출력

사용법:
  cargo run --release --bin smcast-node -- [OPTIONS]

옵션:
  -g, --group <ADDR>     멀티캐스트 그룹 (기본: 239.255.10.1)
  -p, --port <PORT>      포트 (기본: 5500)
  -t, --ttl <TTL>        세션 TTL (기본: 63)
  -i, --interface <IP>   송수신 인터페이스 (기본: OS 선택)
  --min-rate <KBPS>      최소 전송률 kbit/s (기본: 8)
  --max-rate <KBPS>      최대 전송률 kbit/s (기본: 64)
  -w, --window <N>       송신/수신 윈도우 (기본: 64)
  --best-effort          pacing 없이 송신
  --constant             전송률 적응 끔
  --loss-allowed         손실 복구 안 함
  --limited-loss         NACK 재시도 절반
  --no-repair            제3자 복구 참여 안 함
  --stats <SECS>         통계 출력 주기
  -h, --help             이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 지정 (기본: info)
"#
                );
                process::exit(0);
            }
            other => {
                warn!("알 수 없는 옵션: {}", other);
            }
        }
        i += 1;
    }

    node
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node = parse_args();
    let config = node.config;

    let transport = Arc::new(UdpTransport::join(
        node.group,
        node.port,
        node.interface,
        config.ttl,
    )?);
    let (session, mut events) = Session::join(config, transport.clone()).await?;
    let session = Arc::new(session);
    session.spawn_receiver(transport);

    info!(
        "참여: {}:{} as {:08x}",
        node.group,
        node.port,
        session.whoami()
    );

    if let Some(every) = node.stats_interval {
        let stats_session = session.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            while stats_session.is_running() {
                tick.tick().await;
                info!("{}", stats_session.stats().summary());
                for domain in stats_session.domain_stats() {
                    info!("  {}", domain.summary());
                }
            }
        });
    }

    // 수신 이벤트 출력
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Data(packet) => {
                    println!(
                        "[{:08x}{}] {}",
                        packet.source,
                        if packet.reliable { "" } else { " oob" },
                        String::from_utf8_lossy(packet.data())
                    );
                }
                SessionEvent::SequenceError {
                    source,
                    cause,
                    seqno,
                } => {
                    warn!("복구 불가 손실: {:08x} #{} ({:?})", source, seqno, cause);
                }
                SessionEvent::EndOfSequence(source) => {
                    info!("소스 종료: {:08x}", source);
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if !line.is_empty() => session.send(line).await?,
                    Some(_) => {}
                    None => {
                        // 수신 전용: 입력이 끝나도 계속 참여
                        tokio::signal::ctrl_c().await?;
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("{}", session.stats().summary());
    session.stop();
    Ok(())
}
