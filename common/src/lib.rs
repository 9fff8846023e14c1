pub mod engine;
pub mod instruction;
pub mod protocol;
pub mod registry;
pub mod shipping;
pub mod store;
pub mod task;
pub mod wordcount;

/* --------- Identificadores compartidos --------- */

pub type ComputationId = String;
pub type TaskId = String;
pub type WorkerId = String;

/* --------- Re-exports de los tipos que viajan entre procesos --------- */

pub use instruction::{InstructionError, KeyValue, MapInstruction, ReduceInstruction};
pub use protocol::{
    AbortRequest, AbortResponse, AgentMetrics, AgentPingResponse, AgentTask, AgentTaskPayload,
    ComputationStatus, PurgeRequest, PurgeResponse, PushResultRequest, PushResultResponse,
    RegisterRequest, RegisterResponse, RunTaskResponse, RunTaskState, ShippedInstruction,
    TaskResult,
};
pub use registry::InstructionRegistry;
pub use shipping::{AgentTaskFactory, InstructionLoader, ShippingError};
pub use store::{FileResultStore, MemoryResultStore, ResultStore, StoreError};
pub use task::TaskPayload;
