//! Protocol types generated from `proto/chat.proto`.

tonic::include_proto!("chat");

/// Encoded file descriptor set, used to serve gRPC reflection in
/// development environments.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("chat_descriptor");
