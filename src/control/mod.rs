//! Mission Control: task board, agent registry and the war room.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, CORS, ServerConfig)    │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘          │         │                                        │
//!                       │         │ WarRoom::run()                         │
//!                       │         v                                        │
//!                       │  war_room.rs  (orchestrator state machine)       │
//!                       │    ├─ snapshot.rs  (active tasks + agents)       │
//!                       │    ├─ parser.rs    (owner reply blocks)          │
//!                       │    └─ gateway.rs   (AgentGateway, Messaging-     │
//!                       │                     Gateway, OpenClawClient)     │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  db.rs  (ControlDb, DbHandle)                    │
//!                       │    └─ audit.rs  (in-transaction audit append)    │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                            |
//! |------------|-----------------------------------------------------------|
//! | `models`   | Entities, closed enums, patch structs, board view         |
//! | `audit`    | `Actor`, `AuditAction`, append/list of audit events       |
//!
//! ## Typical Flow (`POST /api/war-room/run`)
//!
//! 1. `api::run_war_room` builds a `WarRoom` from settings and the optional
//!    workspace, which may carry its own gateway and Telegram chat.
//! 2. The run opens a WAR_ROOM conversation and takes a `Snapshot` of DOING
//!    and BLOCKED tasks.
//! 3. Each owner is asked for a status block. Linked agents go through the
//!    gateway and the reply is polled from session history; unlinked agents
//!    get a canned reply.
//! 4. Parsed replies update the owner's work state and, with moves enabled,
//!    the task statuses.
//! 5. The decision document is stored as a `WarRoomRun` and the final answer
//!    is posted to Telegram. Delivery failures land on the run record.

pub mod api;
pub mod audit;
pub mod db;
pub mod gateway;
pub mod models;
pub mod parser;
pub mod server;
pub mod snapshot;
pub mod war_room;
