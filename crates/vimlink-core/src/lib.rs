pub mod exit;
pub mod ipc;
pub mod state;
pub mod verify;

pub use exit::{ExitAction, ExitCommand, ExitVerb};
pub use ipc::{
    decode_frame, encode_frame, BrokerEvent, DecodeReport, EditorCall, EditorEvent, FrameError,
    HelpReply, Inbound, InstanceInfo, MacroReply, NdjsonFrameDecoder, Outbound, RemoteFault,
    ReplyFrame, RequestFrame, DEFAULT_MAX_FRAME_BYTES,
};
pub use state::{BufferInfo, EditorState, TabInfo};
pub use verify::{verify_command, CommandFamily, Verification};
