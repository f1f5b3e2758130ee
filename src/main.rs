use mobility_cluster::config::{ClusterConfig, WorkerIdentity};
use mobility_cluster::coordinator::{server, Coordinator};
use mobility_cluster::registry::CodeRegistry;
use mobility_cluster::runtime::TaskLibrary;
use mobility_cluster::worker::WorkerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut role: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut coordinator_url: Option<String> = None;
    let mut worker_name: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--role" => {
                role = Some(args[i + 1].clone());
                i += 2;
            }
            "--port" => {
                port = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--coordinator" => {
                coordinator_url = Some(args[i + 1].clone());
                i += 2;
            }
            "--name" => {
                worker_name = Some(args[i + 1].clone());
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let Some(role) = role else {
        eprintln!("Usage: {} --role coordinator [--port 3001]", args[0]);
        eprintln!(
            "       {} --role worker [--coordinator http://127.0.0.1:3001] [--name worker-a]",
            args[0]
        );
        std::process::exit(1);
    };

    let config = ClusterConfig::from_env();

    match role.as_str() {
        "coordinator" => {
            let port = port.unwrap_or(config.coordinator_port);
            tracing::info!("Starting coordinator on port {}", port);

            let registry = CodeRegistry::new();
            let coordinator = Coordinator::new(config, registry);
            coordinator.clone().spawn_background();

            server::serve(coordinator, port).await?;
        }
        "worker" => {
            let mut identity = WorkerIdentity::from_env();
            if let Some(url) = coordinator_url {
                identity.coordinator_url = url;
            }
            if let Some(name) = worker_name {
                identity.name = name;
            }
            tracing::info!(
                "Starting worker {} ({}) against {}",
                identity.name,
                identity.id.0,
                identity.coordinator_url
            );

            let library = TaskLibrary::builtin();
            let worker = WorkerService::new(identity, config, library);
            worker.run_forever().await;
        }
        other => {
            eprintln!("Unknown role '{}'; expected 'coordinator' or 'worker'", other);
            std::process::exit(1);
        }
    }

    Ok(())
}
