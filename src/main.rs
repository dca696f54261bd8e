use federation_discovery::clock::{Clock, ManualClock, SystemClock};
use federation_discovery::config::DiscoveryConfig;
use federation_discovery::constants;
use federation_discovery::coordinator::DiscoveryCoordinator;
use federation_discovery::node::{NodeRole, NodeStatus};
use federation_discovery::transport::{Inbox, LinkState, MemoryNetwork};
use federation_discovery::{api, config};
use std::sync::Arc;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    constants::print_banner();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    let result = match cmd {
        "demo"  => run_demo().await,
        "serve" => run_serve().await,
        _       => {
            println!("Federation Discovery — commands:");
            println!("  demo   — five-node in-process cluster: join, converge, lose a node");
            println!("  serve  — run this node plus its seeds in-process, with the HTTP dashboard");
            println!();
            println!("  env: DISCOVERY_NODE_ID, DISCOVERY_ROLE, DISCOVERY_REGION,");
            println!("       DISCOVERY_SEEDS=\"id,address,region;...\", DISCOVERY_API_ADDR");
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("❌ {}", e);
        std::process::exit(1);
    }
}

// =============================================================================
// DEMO: deterministic, driven by a manual clock
// =============================================================================

async fn run_demo() -> federation_discovery::Result<()> {
    println!("\n=== Discovery Demo ===\n");
    let net = MemoryNetwork::new();
    let clock = Arc::new(ManualClock::new(0));
    let seeds = config::parse_seeds("eu-head,mem://eu-head,EU");

    let layout = [
        ("eu-head", NodeRole::Coordinator, "EU"),
        ("us-head", NodeRole::Coordinator, "US"),
        ("eu-relay", NodeRole::Relay, "EU"),
        ("eu-peer", NodeRole::Peer, "EU"),
        ("us-peer", NodeRole::Peer, "US"),
    ];

    let mut nodes = Vec::new();
    let mut inboxes = Vec::new();
    for (i, (id, role, region)) in layout.iter().enumerate() {
        let config = DiscoveryConfig::new(id)
            .with_role(*role)
            .with_region(region)
            .with_seeds(seeds.clone())
            .with_rng_seed(i as u64);
        let (transport, inbox) = net.register(id).await;
        let coordinator = DiscoveryCoordinator::new(config, transport, clock.clone())?;
        coordinator.register_self(["relay", "storage"]).await;
        nodes.push(coordinator);
        inboxes.push(inbox);
    }

    println!("🌱 bootstrap through eu-head");
    for node in &nodes {
        node.bootstrap().await;
    }
    let delivered = settle(&nodes, &mut inboxes).await;
    println!("   {} messages delivered\n", delivered);
    print_cluster(&nodes).await;

    println!("\n💀 us-peer goes dark");
    net.set_link("us-peer", LinkState::Down).await;
    for _ in 0..4 {
        clock.advance_ms(10_000);
        for node in &nodes {
            node.send_heartbeats().await;
        }
        settle(&nodes, &mut inboxes).await;
        for node in &nodes {
            node.heartbeat_scan_once().await;
        }
        settle(&nodes, &mut inboxes).await;
    }
    print_cluster(&nodes).await;

    println!("\n📜 last changes seen by eu-head:");
    for change in nodes[0].recent_changes(5).await {
        println!(
            "   #{:<3} {:?} [{}] by [{}] ({:?})",
            change.sequence, change.change_type, change.subject_node_id, change.origin_id, change.priority
        );
    }

    println!("\n📊 {}", nodes[0].get_stats().await);
    println!("📡 {:?}", net.stats().await);
    Ok(())
}

async fn settle(nodes: &[Arc<DiscoveryCoordinator>], inboxes: &mut [Inbox]) -> usize {
    let mut total = 0;
    loop {
        let mut moved = 0;
        for (node, inbox) in nodes.iter().zip(inboxes.iter_mut()) {
            while let Ok(msg) = inbox.try_recv() {
                node.handle_message(msg).await;
                moved += 1;
            }
        }
        if moved == 0 {
            return total;
        }
        total += moved;
    }
}

async fn print_cluster(nodes: &[Arc<DiscoveryCoordinator>]) {
    for node in nodes {
        let snapshot = node.get_topology_snapshot().await;
        let view: Vec<String> = snapshot
            .nodes
            .iter()
            .filter(|n| n.node_id != node.local_id())
            .map(|n| {
                let mark = match n.status {
                    NodeStatus::Online => "✅",
                    NodeStatus::Degraded => "⚠️",
                    NodeStatus::Offline => "💀",
                };
                format!("{}{}", mark, n.node_id)
            })
            .collect();
        println!(
            "   {:<9} v{:<3} routes={:<2} {}",
            node.local_id(),
            snapshot.version,
            snapshot.routes.len(),
            view.join(" ")
        );
    }
}

// =============================================================================
// SERVE: real clock, periodic loops, dashboard
// =============================================================================

async fn run_serve() -> federation_discovery::Result<()> {
    let local = DiscoveryConfig::from_env()?;
    let net = MemoryNetwork::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut cluster = Vec::new();
    for seed in &local.seeds {
        if seed.node_id == local.node_id {
            continue;
        }
        let mut config = DiscoveryConfig::new(&seed.node_id);
        if !seed.region.is_empty() {
            config = config.with_region(&seed.region);
        }
        cluster.push(config);
    }
    cluster.push(local.clone());

    let mut handles = Vec::new();
    let mut coordinators = Vec::new();
    for config in cluster {
        let (transport, inbox) = net.register(&config.node_id).await;
        let coordinator = DiscoveryCoordinator::new(config, transport, Arc::clone(&clock))?;
        handles.push(coordinator.spawn_inbox(inbox));
        coordinators.push(coordinator);
    }
    for coordinator in &coordinators {
        coordinator.start().await;
    }

    let main_node = match coordinators.last() {
        Some(c) => Arc::clone(c),
        None => return Ok(()),
    };
    let watcher = main_node.on_topology_change(|change| {
        log::info!(
            "🔔 {:?} [{}] via {:?} from [{}]",
            change.change_type,
            change.subject_node_id,
            change.discovery_method,
            change.origin_id
        );
    });

    let addr = std::env::var("DISCOVERY_API_ADDR").unwrap_or_else(|_| DEFAULT_API_ADDR.to_string());
    let app = api::router(Arc::clone(&main_node));
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                log::info!("🌐 dashboard on http://{}/v1/status", addr);
                if let Err(e) = axum::serve(listener, app).await {
                    log::error!("dashboard error: {}", e);
                }
            }
            Err(e) => log::error!("failed to bind dashboard on {}: {}", addr, e),
        }
    });

    println!("⏳ [{}] running with {} in-process seeds. Ctrl+C to stop.\n", main_node.local_id(), coordinators.len() - 1);
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for ctrl-c: {}", e);
    }

    for coordinator in &coordinators {
        coordinator.stop().await;
    }
    watcher.abort();
    for handle in handles {
        handle.abort();
    }
    println!("\n{}", main_node.get_stats().await);
    Ok(())
}
