//! # Front-end del Servidor
//! src/server/mod.rs
//!
//! Dueño del socket de escucha y del ciclo de vida del proceso:
//!
//! 1. `listener`: abre el socket (SO_REUSEADDR, backlog)
//! 2. `event_loop`: multiplexa readiness del listener y las conexiones
//! 3. `dispatch`: procesa inline o en el pool de workers, y devuelve las
//!    conexiones keep-alive al loop
//! 4. `process`: arranque, apagado ordenado y aborto
//!
//! El protocolo lo pone la aplicación a través de `handler::HandlerFactory`.

pub mod connection;
pub mod dispatch;
pub mod event_loop;
pub mod handler;
pub mod listener;
pub mod poller;
pub mod process;

pub use connection::{ConnectionState, Phase};
pub use dispatch::{process_connection, Dispatcher, KeepAlive};
pub use event_loop::{EventLoop, LoopExit, Registration};
pub use handler::{ConnectionHandler, HandlerFactory, HandlerResult};
pub use poller::{MioPoller, Multiplexer, Notify, Readiness};
pub use process::{Application, Database, ExitStatus, Mode, ProcessState, ServeContext, ServerProcess};
