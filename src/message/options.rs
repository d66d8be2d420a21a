use std::collections::BTreeMap;

/// Options this library knows by name. The table is the union of every
/// option set the library has historically supported; unknown numbers are
/// still carried opaquely by [`OptionMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
}

impl CoapOption {
    pub fn number(self) -> u16 {
        match self {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
        }
    }

    pub fn from_number(number: u16) -> Option<CoapOption> {
        let option = match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            _ => return None,
        };
        Some(option)
    }
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        option.number()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOption {
    Register = 0,
    Deregister = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    TextPlain = 0,
    ApplicationLinkFormat = 40,
    ApplicationXML = 41,
    ApplicationOctetStream = 42,
    ApplicationEXI = 47,
    ApplicationJSON = 50,
    ApplicationCBOR = 60,
}

impl ContentFormat {
    pub fn from_u16(number: u16) -> Option<ContentFormat> {
        let format = match number {
            0 => ContentFormat::TextPlain,
            40 => ContentFormat::ApplicationLinkFormat,
            41 => ContentFormat::ApplicationXML,
            42 => ContentFormat::ApplicationOctetStream,
            47 => ContentFormat::ApplicationEXI,
            50 => ContentFormat::ApplicationJSON,
            60 => ContentFormat::ApplicationCBOR,
            _ => return None,
        };
        Some(format)
    }

    /// The media type an HTTP peer would use for this format.
    pub fn media_type(self) -> &'static str {
        match self {
            ContentFormat::TextPlain => "text/plain; charset=utf-8",
            ContentFormat::ApplicationLinkFormat => "application/link-format",
            ContentFormat::ApplicationXML => "application/xml",
            ContentFormat::ApplicationOctetStream => "application/octet-stream",
            ContentFormat::ApplicationEXI => "application/exi",
            ContentFormat::ApplicationJSON => "application/json",
            ContentFormat::ApplicationCBOR => "application/cbor",
        }
    }

    /// Parameters after `;` are ignored except for plain text.
    pub fn from_media_type(media_type: &str) -> Option<ContentFormat> {
        let essence = media_type.split(';').next().unwrap_or("").trim();
        let format = match essence.to_ascii_lowercase().as_str() {
            "text/plain" => ContentFormat::TextPlain,
            "application/link-format" => ContentFormat::ApplicationLinkFormat,
            "application/xml" => ContentFormat::ApplicationXML,
            "application/octet-stream" => ContentFormat::ApplicationOctetStream,
            "application/exi" => ContentFormat::ApplicationEXI,
            "application/json" => ContentFormat::ApplicationJSON,
            "application/cbor" => ContentFormat::ApplicationCBOR,
            _ => return None,
        };
        Some(format)
    }
}

/// Encodes an integer as a CoAP `uint` option value: big-endian with leading
/// zero bytes stripped, so zero is the empty string.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes a CoAP `uint` option value. Values wider than four bytes are rejected.
pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, b| acc << 8 | *b as u32))
}

/// Ordered multimap from option number to option values.
///
/// Numbers iterate in ascending order; values under one number keep the
/// order they were added in, which is the order they go on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionMap {
    entries: BTreeMap<u16, Vec<Vec<u8>>>,
}

impl OptionMap {
    pub fn new() -> OptionMap {
        OptionMap::default()
    }

    /// Appends `value` to the values of `number`. Existing values are kept.
    pub fn add(&mut self, number: u16, value: Vec<u8>) {
        self.entries.entry(number).or_default().push(value);
    }

    /// Replaces every value of `number` with `value`.
    pub fn set(&mut self, number: u16, value: Vec<u8>) {
        self.entries.insert(number, vec![value]);
    }

    pub fn get(&self, number: u16) -> Option<&[Vec<u8>]> {
        self.entries.get(&number).map(|values| values.as_slice())
    }

    pub fn first(&self, number: u16) -> Option<&[u8]> {
        self.entries
            .get(&number)
            .and_then(|values| values.first())
            .map(|value| value.as_slice())
    }

    pub fn remove(&mut self, number: u16) -> Option<Vec<Vec<u8>>> {
        self.entries.remove(&number)
    }

    pub fn contains(&self, number: u16) -> bool {
        self.entries.contains_key(&number)
    }

    /// Number of distinct option numbers present.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every `(number, value)` pair in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        self.entries
            .iter()
            .flat_map(|(number, values)| values.iter().map(move |v| (*number, v.as_slice())))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_is_additive() {
        let mut options = OptionMap::new();
        options.add(CoapOption::UriPath.number(), b"sensors".to_vec());
        options.add(CoapOption::UriPath.number(), b"temp".to_vec());

        assert_eq!(
            options.get(11).unwrap(),
            &[b"sensors".to_vec(), b"temp".to_vec()][..]
        );
        assert_eq!(options.first(11).unwrap(), b"sensors");
        assert_eq!(options.len(), 1);
    }

    #[test]
    fn test_set_replaces() {
        let mut options = OptionMap::new();
        options.add(6, vec![1]);
        options.add(6, vec![2]);
        options.set(6, vec![]);
        assert_eq!(options.get(6).unwrap(), &[Vec::<u8>::new()][..]);
    }

    #[test]
    fn test_iter_ascending() {
        let mut options = OptionMap::new();
        options.add(60, vec![1]);
        options.add(11, b"b".to_vec());
        options.add(3, b"host".to_vec());
        options.add(11, b"a".to_vec());

        let order: Vec<(u16, Vec<u8>)> = options.iter().map(|(n, v)| (n, v.to_vec())).collect();
        assert_eq!(
            order,
            vec![
                (3, b"host".to_vec()),
                (11, b"b".to_vec()),
                (11, b"a".to_vec()),
                (60, vec![1]),
            ]
        );
    }

    #[test]
    fn test_uint() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(1), vec![1]);
        assert_eq!(encode_uint(0x0100), vec![1, 0]);
        assert_eq!(encode_uint(8388607), vec![0x7F, 0xFF, 0xFF]);
        assert_eq!(decode_uint(&[]), Some(0));
        assert_eq!(decode_uint(&[0x7F, 0xFF, 0xFF]), Some(8388607));
        assert_eq!(decode_uint(&[0, 0, 0, 0, 1]), None);
    }

    #[test]
    fn test_option_table() {
        for number in 0..=300u16 {
            if let Some(option) = CoapOption::from_number(number) {
                assert_eq!(option.number(), number);
            }
        }
        assert_eq!(CoapOption::from_number(28), Some(CoapOption::Size2));
        assert_eq!(CoapOption::from_number(2), None);
    }

    #[test]
    fn test_content_format_media_types() {
        assert_eq!(
            ContentFormat::from_media_type("application/json; charset=utf-8"),
            Some(ContentFormat::ApplicationJSON)
        );
        assert_eq!(
            ContentFormat::from_media_type(ContentFormat::TextPlain.media_type()),
            Some(ContentFormat::TextPlain)
        );
        assert_eq!(ContentFormat::from_media_type("image/png"), None);
        assert_eq!(ContentFormat::from_u16(60), Some(ContentFormat::ApplicationCBOR));
    }
}
