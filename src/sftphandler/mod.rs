mod sftphandler;
mod sftpoutputchannelhandler;

pub use sftphandler::SftpHandler;
pub use sftpoutputchannelhandler::{SftpOutputConsumer, SftpOutputPipe, SftpOutputProducer};
