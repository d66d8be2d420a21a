use std::fmt;

/// The CoAP version carried in every header.
pub const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    /// The 2-bit value used on the wire.
    pub fn to_bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    pub fn from_bits(bits: u8) -> MessageType {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    // 200 Codes
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    Continue,

    // 400 Codes
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestEntityIncomplete,
    PreconditionFailed,
    RequestEntityTooLarge,
    UnsupportedContentFormat,
    TooManyRequests,

    // 500 Codes
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ProxyingNotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Empty,
    Request(Method),
    Response(ResponseCode),
    Reserved(u8),
}

impl From<Method> for u8 {
    fn from(method: Method) -> u8 {
        class_to_code(&MessageClass::Request(method))
    }
}

impl From<ResponseCode> for u8 {
    fn from(status: ResponseCode) -> u8 {
        class_to_code(&MessageClass::Response(status))
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&class_to_str(self))
    }
}

pub fn class_to_code(class: &MessageClass) -> u8 {
    match *class {
        MessageClass::Empty => 0x00,

        MessageClass::Request(Method::Get) => 0x01,
        MessageClass::Request(Method::Post) => 0x02,
        MessageClass::Request(Method::Put) => 0x03,
        MessageClass::Request(Method::Delete) => 0x04,

        MessageClass::Response(ResponseCode::Created) => 0x41,
        MessageClass::Response(ResponseCode::Deleted) => 0x42,
        MessageClass::Response(ResponseCode::Valid) => 0x43,
        MessageClass::Response(ResponseCode::Changed) => 0x44,
        MessageClass::Response(ResponseCode::Content) => 0x45,
        MessageClass::Response(ResponseCode::Continue) => 0x5F,

        MessageClass::Response(ResponseCode::BadRequest) => 0x80,
        MessageClass::Response(ResponseCode::Unauthorized) => 0x81,
        MessageClass::Response(ResponseCode::BadOption) => 0x82,
        MessageClass::Response(ResponseCode::Forbidden) => 0x83,
        MessageClass::Response(ResponseCode::NotFound) => 0x84,
        MessageClass::Response(ResponseCode::MethodNotAllowed) => 0x85,
        MessageClass::Response(ResponseCode::NotAcceptable) => 0x86,
        MessageClass::Response(ResponseCode::RequestEntityIncomplete) => 0x88,
        MessageClass::Response(ResponseCode::PreconditionFailed) => 0x8C,
        MessageClass::Response(ResponseCode::RequestEntityTooLarge) => 0x8D,
        MessageClass::Response(ResponseCode::UnsupportedContentFormat) => 0x8F,
        MessageClass::Response(ResponseCode::TooManyRequests) => 0x9D,

        MessageClass::Response(ResponseCode::InternalServerError) => 0xA0,
        MessageClass::Response(ResponseCode::NotImplemented) => 0xA1,
        MessageClass::Response(ResponseCode::BadGateway) => 0xA2,
        MessageClass::Response(ResponseCode::ServiceUnavailable) => 0xA3,
        MessageClass::Response(ResponseCode::GatewayTimeout) => 0xA4,
        MessageClass::Response(ResponseCode::ProxyingNotSupported) => 0xA5,

        MessageClass::Reserved(code) => code,
    }
}

pub fn code_to_class(code: &u8) -> MessageClass {
    match *code {
        0x00 => MessageClass::Empty,

        0x01 => MessageClass::Request(Method::Get),
        0x02 => MessageClass::Request(Method::Post),
        0x03 => MessageClass::Request(Method::Put),
        0x04 => MessageClass::Request(Method::Delete),

        0x41 => MessageClass::Response(ResponseCode::Created),
        0x42 => MessageClass::Response(ResponseCode::Deleted),
        0x43 => MessageClass::Response(ResponseCode::Valid),
        0x44 => MessageClass::Response(ResponseCode::Changed),
        0x45 => MessageClass::Response(ResponseCode::Content),
        0x5F => MessageClass::Response(ResponseCode::Continue),

        0x80 => MessageClass::Response(ResponseCode::BadRequest),
        0x81 => MessageClass::Response(ResponseCode::Unauthorized),
        0x82 => MessageClass::Response(ResponseCode::BadOption),
        0x83 => MessageClass::Response(ResponseCode::Forbidden),
        0x84 => MessageClass::Response(ResponseCode::NotFound),
        0x85 => MessageClass::Response(ResponseCode::MethodNotAllowed),
        0x86 => MessageClass::Response(ResponseCode::NotAcceptable),
        0x88 => MessageClass::Response(ResponseCode::RequestEntityIncomplete),
        0x8C => MessageClass::Response(ResponseCode::PreconditionFailed),
        0x8D => MessageClass::Response(ResponseCode::RequestEntityTooLarge),
        0x8F => MessageClass::Response(ResponseCode::UnsupportedContentFormat),
        0x9D => MessageClass::Response(ResponseCode::TooManyRequests),

        0xA0 => MessageClass::Response(ResponseCode::InternalServerError),
        0xA1 => MessageClass::Response(ResponseCode::NotImplemented),
        0xA2 => MessageClass::Response(ResponseCode::BadGateway),
        0xA3 => MessageClass::Response(ResponseCode::ServiceUnavailable),
        0xA4 => MessageClass::Response(ResponseCode::GatewayTimeout),
        0xA5 => MessageClass::Response(ResponseCode::ProxyingNotSupported),

        other => MessageClass::Reserved(other),
    }
}

/// Renders a raw code in the dotted `c.dd` notation.
pub fn code_to_str(code: &u8) -> String {
    let class_code = (0xE0 & code) >> 5;
    let detail_code = 0x1F & code;

    format!("{}.{:02}", class_code, detail_code)
}

pub fn class_to_str(class: &MessageClass) -> String {
    code_to_str(&class_to_code(class))
}

/// Requests occupy class 0 with a non-zero detail.
pub fn is_request_code(code: u8) -> bool {
    code != 0 && code >> 5 == 0
}

/// Responses occupy classes 2 through 5.
pub fn is_response_code(code: u8) -> bool {
    (2..=5).contains(&(code >> 5))
}
