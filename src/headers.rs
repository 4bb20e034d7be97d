//! Typed header names and Content-Type values used on the wire.

wire_tokens! {
    /// Header names this crate reads or writes.
    ///
    /// Framing headers (`Content-Type`, `Content-Length`, `Reply-Text`) sit on
    /// the outer envelope; the rest are event headers.
    pub Header / ParseHeaderError: "header" {
        ContentType => "Content-Type",
        ContentLength => "Content-Length",
        ContentDisposition => "Content-Disposition",
        ReplyText => "Reply-Text",
        EventName => "Event-Name",
        EventSubclass => "Event-Subclass",
        JobUuid => "Job-UUID",
        UniqueId => "Unique-ID",
        CoreUuid => "Core-UUID",
    }
}

wire_tokens! {
    /// `Content-Type` values sent by FreeSWITCH.
    pub ContentType / ParseContentTypeError: "content type" {
        AuthRequest => "auth/request",
        CommandReply => "command/reply",
        ApiResponse => "api/response",
        EventPlain => "text/event-plain",
        EventJson => "text/event-json",
        EventXml => "text/event-xml",
        DisconnectNotice => "text/disconnect-notice",
        LogData => "log/data",
    }
}

impl ContentType {
    /// Asynchronous traffic rather than a reply to the last command.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            ContentType::EventPlain
                | ContentType::EventJson
                | ContentType::EventXml
                | ContentType::LogData
        )
    }
}
