pub mod codec;
pub mod handshake;
pub mod packet;

pub use codec::PacketCodec;
pub use handshake::{
    is_eof_packet, is_err_packet, is_ok_packet, is_result_set_end, ok_status,
    result_set_end_status, ErrPacket, HandshakeResponse, InitialHandshake, StmtPrepareOk,
};
pub use packet::{capabilities, command, status, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
