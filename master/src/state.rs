// master/src/state.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::shipping::AgentTaskFactory;
use common::WorkerId;

use crate::collector::ResultCollector;
use crate::config::MasterConfig;
use crate::master::Master;
use crate::pool::Pool;
use crate::remote::RemoteAgentWorker;

#[derive(Clone)]
pub struct AppState {
    pub cfg: MasterConfig,
    pub pool: Arc<Pool>,
    pub collector: Arc<ResultCollector>,
    pub factory: Arc<AgentTaskFactory>,
    pub master: Arc<Master>,
    // agentes registrados, por id
    pub agents: Arc<Mutex<HashMap<WorkerId, Arc<RemoteAgentWorker>>>>,
}
