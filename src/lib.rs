//! Pipelined PostgreSQL wire-protocol client.
//!
//! **Layers:** binary codecs (`codec`), pure message encoding and parsing
//! (`protocol`), and the async connection with its FIFO response loop (`driver`).
//!
//! ```ignore
//! let conn = Connection::connect("postgres://app@localhost/orders".parse()?).await?;
//! let result = conn.query("SELECT id, total FROM orders WHERE id = $1", params![42]).await?;
//! for row in &result.rows {
//!     println!("{:?} {:?}", row.get_i64(0), row.get_f64_by_name("total"));
//! }
//! ```

pub mod codec;
pub mod driver;
pub mod protocol;

pub use codec::registry::TypeHint;
pub use codec::{Codec, CodecError, CodecRegistry, Value};
pub use driver::{
    bind_param, ConnectOptions, Connection, Param, PgError, PgResult, PgRow, QueryOptions,
    QueryResult, ServerEvent, SslMode,
};
