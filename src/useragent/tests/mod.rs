mod test_useragent;
