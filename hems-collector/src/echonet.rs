//! ECHONET Lite frame codec.
//!
//! Frames exchanged with the meter have the fixed layout
//!
//! ```text
//! EHD(2) TID(2) SEOJ(3) DEOJ(3) ESV(1) OPC(1) { EPC(1) PDC(1) EDT(PDC) } * OPC
//! ```
//!
//! All multi-byte fields are big-endian.

use thiserror::Error;

/// ECHONET Lite header for the standard (specified message) format.
pub const EHD: [u8; 2] = [0x10, 0x81];

/// Size of the fixed part of a frame, up to and including OPC.
const HEADER_LEN: usize = 12;

/// Errors raised when bytes received from the meter are not a valid frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Frame truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Invalid ECHONET Lite header: {0:#06x}")]
    InvalidHeader(u16),

    #[error("Unknown service code: {0:#04x}")]
    UnknownService(u8),

    #[error("Property {code:#04x} declares {declared} bytes but only {remaining} remain")]
    PropertyOverrun {
        code: u8,
        declared: usize,
        remaining: usize,
    },

    #[error("{0} trailing bytes after the last property")]
    TrailingBytes(usize),
}

/// Errors raised when a frame cannot be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("Too many properties in one frame: {0}")]
    TooManyProperties(usize),

    #[error("Property {code:#04x} payload too long: {len} bytes")]
    PayloadTooLong { code: u8, len: usize },
}

/// An ECHONET Lite object (class group, class, instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EchonetObject {
    pub class_group: u8,
    pub class: u8,
    pub instance: u8,
}

impl EchonetObject {
    /// Controller (this collector).
    pub const CONTROLLER: Self = Self::new(0x05, 0xFF, 0x01);

    /// Low-voltage smart electric energy meter.
    pub const SMART_METER: Self = Self::new(0x02, 0x88, 0x01);

    pub const fn new(class_group: u8, class: u8, instance: u8) -> Self {
        Self {
            class_group,
            class,
            instance,
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.class_group, self.class, self.instance]
    }

    fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2])
    }
}

impl std::fmt::Display for EchonetObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}{:02X}{:02X}",
            self.class_group, self.class, self.instance
        )
    }
}

/// ECHONET Lite service (ESV).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCode {
    SetISna,
    SetCSna,
    GetSna,
    InfSna,
    SetI,
    SetC,
    Get,
    InfReq,
    SetRes,
    GetRes,
    Inf,
    InfC,
    InfCRes,
}

impl ServiceCode {
    pub fn as_byte(self) -> u8 {
        match self {
            ServiceCode::SetISna => 0x50,
            ServiceCode::SetCSna => 0x51,
            ServiceCode::GetSna => 0x52,
            ServiceCode::InfSna => 0x53,
            ServiceCode::SetI => 0x60,
            ServiceCode::SetC => 0x61,
            ServiceCode::Get => 0x62,
            ServiceCode::InfReq => 0x63,
            ServiceCode::SetRes => 0x71,
            ServiceCode::GetRes => 0x72,
            ServiceCode::Inf => 0x73,
            ServiceCode::InfC => 0x74,
            ServiceCode::InfCRes => 0x7A,
        }
    }

    /// "Service not available" responses.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ServiceCode::SetISna | ServiceCode::SetCSna | ServiceCode::GetSna | ServiceCode::InfSna
        )
    }

    /// Whether `self` is a reply (success or SNA) to a request with `request` service.
    pub fn answers(self, request: ServiceCode) -> bool {
        matches!(
            (request, self),
            (ServiceCode::Get, ServiceCode::GetRes | ServiceCode::GetSna)
                | (ServiceCode::SetC, ServiceCode::SetRes | ServiceCode::SetCSna)
                | (ServiceCode::SetI, ServiceCode::SetISna)
                | (ServiceCode::InfReq, ServiceCode::Inf | ServiceCode::InfSna)
                | (ServiceCode::InfC, ServiceCode::InfCRes)
        )
    }
}

impl TryFrom<u8> for ServiceCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let service = match value {
            0x50 => ServiceCode::SetISna,
            0x51 => ServiceCode::SetCSna,
            0x52 => ServiceCode::GetSna,
            0x53 => ServiceCode::InfSna,
            0x60 => ServiceCode::SetI,
            0x61 => ServiceCode::SetC,
            0x62 => ServiceCode::Get,
            0x63 => ServiceCode::InfReq,
            0x71 => ServiceCode::SetRes,
            0x72 => ServiceCode::GetRes,
            0x73 => ServiceCode::Inf,
            0x74 => ServiceCode::InfC,
            0x7A => ServiceCode::InfCRes,
            other => return Err(DecodeError::UnknownService(other)),
        };
        Ok(service)
    }
}

/// A single property (EPC) with its data (EDT).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub code: u8,
    pub data: Vec<u8>,
}

impl Property {
    pub fn new(code: u8, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    /// Property with an empty payload, as used in Get requests.
    pub fn empty(code: u8) -> Self {
        Self::new(code, Vec::new())
    }
}

/// A decoded ECHONET Lite frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tid: u16,
    pub source: EchonetObject,
    pub destination: EchonetObject,
    pub service: ServiceCode,
    pub properties: Vec<Property>,
}

impl Frame {
    /// Build a Get request from the controller to the meter.
    ///
    /// Duplicate codes are dropped; order is preserved.
    pub fn get_request(tid: u16, codes: &[u8]) -> Self {
        let mut properties: Vec<Property> = Vec::with_capacity(codes.len());
        for &code in codes {
            if !properties.iter().any(|p| p.code == code) {
                properties.push(Property::empty(code));
            }
        }

        Self {
            tid,
            source: EchonetObject::CONTROLLER,
            destination: EchonetObject::SMART_METER,
            service: ServiceCode::Get,
            properties,
        }
    }

    /// Build a SetC request writing one property on the meter.
    pub fn set_request(tid: u16, code: u8, data: Vec<u8>) -> Self {
        Self {
            tid,
            source: EchonetObject::CONTROLLER,
            destination: EchonetObject::SMART_METER,
            service: ServiceCode::SetC,
            properties: vec![Property::new(code, data)],
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let opc = u8::try_from(self.properties.len())
            .map_err(|_| EncodeError::TooManyProperties(self.properties.len()))?;

        let body_len: usize = self.properties.iter().map(|p| 2 + p.data.len()).sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.extend_from_slice(&EHD);
        out.extend_from_slice(&self.tid.to_be_bytes());
        out.extend_from_slice(&self.source.to_bytes());
        out.extend_from_slice(&self.destination.to_bytes());
        out.push(self.service.as_byte());
        out.push(opc);

        for property in &self.properties {
            let pdc = u8::try_from(property.data.len()).map_err(|_| EncodeError::PayloadTooLong {
                code: property.code,
                len: property.data.len(),
            })?;
            out.push(property.code);
            out.push(pdc);
            out.extend_from_slice(&property.data);
        }

        Ok(out)
    }

    /// Parse wire bytes into a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        if bytes[0..2] != EHD {
            return Err(DecodeError::InvalidHeader(u16::from_be_bytes([
                bytes[0], bytes[1],
            ])));
        }

        let tid = u16::from_be_bytes([bytes[2], bytes[3]]);
        let source = EchonetObject::from_slice(&bytes[4..7]);
        let destination = EchonetObject::from_slice(&bytes[7..10]);
        let service = ServiceCode::try_from(bytes[10])?;
        let opc = bytes[11] as usize;

        let mut properties = Vec::with_capacity(opc);
        let mut pos = HEADER_LEN;
        for _ in 0..opc {
            if bytes.len() < pos + 2 {
                return Err(DecodeError::Truncated {
                    needed: pos + 2,
                    actual: bytes.len(),
                });
            }
            let code = bytes[pos];
            let pdc = bytes[pos + 1] as usize;
            pos += 2;

            let remaining = bytes.len() - pos;
            if pdc > remaining {
                return Err(DecodeError::PropertyOverrun {
                    code,
                    declared: pdc,
                    remaining,
                });
            }
            properties.push(Property::new(code, bytes[pos..pos + pdc].to_vec()));
            pos += pdc;
        }

        if pos != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - pos));
        }

        Ok(Self {
            tid,
            source,
            destination,
            service,
            properties,
        })
    }

    /// Look up a property by EPC.
    pub fn property(&self, code: u8) -> Option<&Property> {
        self.properties.iter().find(|p| p.code == code)
    }

    /// EPCs carried by this frame, in order.
    pub fn property_codes(&self) -> Vec<u8> {
        self.properties.iter().map(|p| p.code).collect()
    }

    /// Whether this frame is a reply to `request`.
    ///
    /// Correlation uses the service pair and the property codes only: every
    /// code in the reply must have been requested.
    pub fn answers(&self, request: &Frame) -> bool {
        self.service.answers(request.service)
            && !self.properties.is_empty()
            && self
                .properties
                .iter()
                .all(|p| request.property(p.code).is_some())
    }
}

/// Encode a Get request listing each of `codes` with an empty payload.
pub fn encode_request(tid: u16, codes: &[u8]) -> Result<Vec<u8>, EncodeError> {
    Frame::get_request(tid, codes).encode()
}

/// Encode a SetC request writing `data` to property `code`.
pub fn encode_set(tid: u16, code: u8, data: &[u8]) -> Result<Vec<u8>, EncodeError> {
    Frame::set_request(tid, code, data.to_vec()).encode()
}
