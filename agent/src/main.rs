mod executor;
mod handlers;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::protocol::{RegisterRequest, RegisterResponse};
use common::registry::InstructionRegistry;
use common::shipping::InstructionLoader;
use common::store::{FileResultStore, MemoryResultStore, ResultStore};
use hostname;
use reqwest::Client;
use tracing::{info, warn};
use tracing_subscriber;

use crate::executor::Executor;

const DEFAULT_AGENT_PORT: u16 = 8090;

/// Obtiene la URL base del master.
/// - En Docker usaremos: MASTER_URL=http://master:8080
/// - Si no está definida, usa http://localhost:8080 (para pruebas locales)
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

/// IP y puerto con los que el master nos va a llamar de vuelta.
/// - En Docker: AGENT_HOST=agent1, AGENT_PORT=8090
/// - En local alcanza con los defaults
fn callback_addr() -> (String, u16) {
    let host = env::var("AGENT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("AGENT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_AGENT_PORT);
    (host, port)
}

fn build_store() -> Result<Arc<dyn ResultStore>> {
    let kind = env::var("STORE_KIND").unwrap_or_else(|_| "memory".to_string());
    match kind.as_str() {
        "file" => {
            let dir = env::var("STORE_DIR").unwrap_or_else(|_| "./agent-results".to_string());
            Ok(Arc::new(FileResultStore::new(dir)?))
        }
        _ => Ok(Arc::new(MemoryResultStore::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("agent=debug,common=debug,axum=info")
        .init();

    let master_url = master_base_url();
    let (host, port) = callback_addr();

    // Nombre de host (solo para info)
    let hostname_str = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    // 1) Armar el executor con las instrucciones de serie
    let registry = Arc::new(InstructionRegistry::with_builtins());
    let loader = Arc::new(InstructionLoader::new(registry));
    let store = build_store()?;
    let executor = Executor::new(loader, store, master_url.clone());

    // 2) Abrir el puerto antes de registrarnos: si el master nos manda una
    //    tarea apenas nos acepta, la conexión queda en cola hasta que servimos
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("agente escuchando en 0.0.0.0:{}", port);

    // 3) Registrarse en el master (de fondo, con reintentos)
    tokio::spawn(register_loop(master_url, host, port, hostname_str));

    // 4) Servidor HTTP: run/abort/purge/health
    let app = handlers::build_router(executor);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Insiste contra el master hasta que nos reconozca. Si el master todavía no
/// levantó, reintentamos cada 2s.
async fn register_loop(master_url: String, ip: String, port: u16, hostname: String) {
    let client = Client::new();
    let register_url = format!("{}/api/v1/agents/register", master_url);
    let req = RegisterRequest { ip, port, hostname };

    loop {
        match client.post(&register_url).json(&req).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<RegisterResponse>().await {
                    Ok(ack) if ack.acknowledged => {
                        info!("registrados contra el master con id {}", ack.agent_id);
                        return;
                    }
                    Ok(_) => warn!("el master no nos reconoció, reintentamos..."),
                    Err(err) => warn!("respuesta de registro ilegible: {}", err),
                }
            }
            Ok(resp) => warn!("el master respondió {} al registro", resp.status()),
            Err(err) => warn!("no llegamos al master ({}), reintentamos...", err),
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
