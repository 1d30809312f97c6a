use parley_transport::{LiveTransport, OutboundMessage, TransportError};

mockall::mock! {
    pub Transport {}
    impl LiveTransport for Transport {
        fn connect(&mut self, username: &str) -> Result<(), TransportError>;
        fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;
        fn set_typing(&mut self, typing: bool) -> Result<(), TransportError>;
        fn keep_typing(&mut self) -> Result<(), TransportError>;
        fn disconnect(&mut self) -> Result<(), TransportError>;
    }
}
