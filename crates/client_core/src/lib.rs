//! Client-side cache reconciliation for a chat backend: realtime deltas and
//! paged RPC results folded into consistent, UI-ready snapshots.

pub mod channel_list;
pub mod config;
pub mod decoder;
pub mod error;
pub mod members;
pub mod mentions;
pub mod message_cache;
pub mod pager;
pub mod rpc;
pub mod scheduler;
pub mod search;
pub mod session;
pub mod transport;

pub use channel_list::{ChannelEntry, ChannelKind, ChannelListCache, RefreshTicket};
pub use config::{load_settings, Settings};
pub use decoder::{decode, parse_frame, Frame, RawEnvelope, RealtimeDelta};
pub use error::{ClientError, ClientResult};
pub use members::ChannelMembers;
pub use mentions::MentionFeed;
pub use message_cache::{FetchEdge, FetchTicket, MessageWindow, WindowPhase};
pub use pager::{PageRequest, PageSource, Pager};
pub use rpc::{ChatBackend, HttpChatBackend, MissingChatBackend, SearchQuery};
pub use scheduler::CoalescingScheduler;
pub use search::{SearchResults, SearchSource};
pub use session::{ChatSession, SessionEvent, SessionOptions};
pub use transport::connect_realtime;
