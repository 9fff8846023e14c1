mod collector;
mod config;
mod handlers;
mod master;
mod pool;
mod remote;
mod state;
mod task;
mod worker;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use common::instruction::{MapInstruction, ReduceInstruction};
use common::registry::InstructionRegistry;
use common::shipping::AgentTaskFactory;
use common::store::{FileResultStore, MemoryResultStore, ResultStore};
use glob::glob;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::collector::ResultCollector;
use crate::config::MasterConfig;
use crate::master::Master;
use crate::pool::Pool;
use crate::state::AppState;
use crate::worker::LocalWorker;

#[derive(Parser)]
#[command(name = "master")]
#[command(about = "Master Map/Reduce: corre una computación sobre el pool")]
struct Cli {
    /// Glob de archivos de entrada; cada archivo es un input
    #[arg(long)]
    input: Option<String>,

    /// Inputs directos por línea de comando (se suman a --input)
    #[arg(long = "inline")]
    inline: Vec<String>,

    /// Instrucción Map registrada
    #[arg(long, default_value = "word_split")]
    map: String,

    /// Combiner opcional (un reduce local después del map)
    #[arg(long)]
    combiner: Option<String>,

    /// Instrucción Reduce registrada
    #[arg(long, default_value = "sum")]
    reduce: String,

    /// Cuántos workers locales arrancar
    #[arg(long, default_value_t = 2)]
    local_workers: usize,

    /// Esperar a que se registren tantos agentes remotos antes de arrancar
    #[arg(long, default_value_t = 0)]
    wait_for_agents: usize,

    /// Archivo de salida (clave,valor por línea); sin esto va a stdout
    #[arg(long)]
    output: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("master=debug,common=debug,axum=info")
        .init();

    let cli = Cli::parse();
    let cfg = MasterConfig::from_env();

    let registry = Arc::new(InstructionRegistry::with_builtins());
    let factory = Arc::new(AgentTaskFactory::new(
        registry.clone(),
        cfg.shipping_cache_capacity,
    ));
    let collector = ResultCollector::new(cfg.available_result_ttl, cfg.requested_result_ttl);
    let pool = Pool::new();
    let master = Master::new(pool.clone(), cfg.clone());

    // workers locales, cada uno con su propio store
    for i in 0..cli.local_workers {
        let id = format!("local-{}", i);
        let store = build_store(&cfg, &id)?;
        let worker = LocalWorker::new(&id, &pool, store);
        pool.donate_worker(worker);
    }

    // loops de fondo: despacho del pool y limpieza del collector
    tokio::spawn(pool.clone().run_dispatch_loop());
    tokio::spawn(collector.clone().run_cleanup_loop(cfg.result_cleanup_interval));

    // servidor HTTP para registro de agentes, push de resultados y estado
    let state = AppState {
        cfg: cfg.clone(),
        pool: pool.clone(),
        collector: collector.clone(),
        factory: factory.clone(),
        master: master.clone(),
        agents: Arc::new(Mutex::new(HashMap::new())),
    };
    let app = handlers::build_router(state);
    let listener = TcpListener::bind(&cfg.bind_addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("el servidor HTTP se cayó: {}", err);
        }
    });

    // esperar agentes remotos si los pidieron
    let wanted = cli.local_workers + cli.wait_for_agents;
    while pool.worker_count() < wanted {
        info!(
            "esperando agentes: {}/{} workers en el pool",
            pool.worker_count(),
            wanted
        );
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    let inputs = collect_inputs(&cli)?;
    if inputs.is_empty() {
        return Err(anyhow!("sin inputs: pasá --input o --inline"));
    }

    let (map_instruction, combiner, reduce_instruction) = build_instructions(&registry, &cli)?;
    let result = master
        .run_computation(map_instruction, combiner, reduce_instruction, inputs)
        .await?;

    let mut entries: Vec<(String, String)> = result.into_iter().collect();
    entries.sort();
    match &cli.output {
        Some(path) => {
            let mut file =
                fs::File::create(path).with_context(|| format!("no pudimos crear {}", path))?;
            for (key, value) in &entries {
                writeln!(file, "{},{}", key, value)?;
            }
            info!("resultado escrito en {} ({} claves)", path, entries.len());
        }
        None => {
            for (key, value) in &entries {
                println!("{},{}", key, value);
            }
        }
    }

    Ok(())
}

fn build_store(cfg: &MasterConfig, worker_id: &str) -> Result<Arc<dyn ResultStore>> {
    match cfg.store_kind.as_str() {
        "file" => {
            let dir = std::path::Path::new(&cfg.store_dir).join(worker_id);
            Ok(Arc::new(FileResultStore::new(dir)?))
        }
        _ => Ok(Arc::new(MemoryResultStore::new())),
    }
}

fn collect_inputs(cli: &Cli) -> Result<Vec<String>> {
    let mut inputs = cli.inline.clone();
    if let Some(pattern) = &cli.input {
        for entry in glob(pattern).context("patrón de --input inválido")? {
            let path = entry?;
            if path.is_file() {
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("no pudimos leer {}", path.display()))?;
                inputs.push(contents);
            }
        }
    }
    Ok(inputs)
}

fn build_instructions(
    registry: &InstructionRegistry,
    cli: &Cli,
) -> Result<(
    Arc<dyn MapInstruction>,
    Option<Arc<dyn ReduceInstruction>>,
    Arc<dyn ReduceInstruction>,
)> {
    let null = serde_json::Value::Null;
    let map = registry
        .map_factory(&cli.map)
        .ok_or_else(|| anyhow!("instrucción map desconocida: {}", cli.map))?(&null)?;
    let combiner = match &cli.combiner {
        Some(name) => Some(
            registry
                .reduce_factory(name)
                .ok_or_else(|| anyhow!("combiner desconocido: {}", name))?(&null)?,
        ),
        None => None,
    };
    let reduce = registry
        .reduce_factory(&cli.reduce)
        .ok_or_else(|| anyhow!("instrucción reduce desconocida: {}", cli.reduce))?(&null)?;
    Ok((map, combiner, reduce))
}
